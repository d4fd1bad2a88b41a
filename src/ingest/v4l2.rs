//! Live V4L2 cameras (`/dev/videoN`).
//!
//! The device is asked for RGB3 at 640x480; whatever format it settles on
//! must be RGB3 or NV12, and frames are normalised to BGR8.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{buffer_to_color, PixelFormat};
use super::FrameSource;
use crate::frame::ColorImage;

const PREFERRED_WIDTH: u32 = 640;
const PREFERRED_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;

pub struct V4l2Source {
    device_path: String,
    state: V4l2State,
    format: PixelFormat,
    width: u32,
    height: u32,
    frames_captured: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn open(device_path: &str) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = PREFERRED_WIDTH;
        format.height = PREFERRED_HEIGHT;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let pixel_format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"NV12" => PixelFormat::Nv12,
            other => {
                return Err(anyhow!(
                    "v4l2 device {} delivers unsupported format {}",
                    device_path,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: connected to {} ({}x{}, {:?})",
            device_path,
            format.width,
            format.height,
            pixel_format
        );

        Ok(Self {
            device_path: device_path.to_string(),
            state,
            format: pixel_format,
            width: format.width,
            height: format.height,
            frames_captured: 0,
        })
    }
}

impl FrameSource for V4l2Source {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn frame_count(&self) -> Option<u64> {
        None
    }

    fn read_frame(&mut self) -> Result<Option<ColorImage>> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let image = self
            .state
            .with_mut(|fields| {
                fields
                    .stream
                    .next()
                    .map(|(buf, _meta)| buffer_to_color(buf, width, height, format))
            })
            .with_context(|| format!("capture v4l2 frame from {}", self.device_path))??;
        self.frames_captured += 1;
        log::trace!(
            "V4l2Source: frame {} from {}",
            self.frames_captured,
            self.device_path
        );
        Ok(Some(image))
    }
}
