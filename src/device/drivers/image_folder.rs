//! `CVImageCapture`: numbered image folders.
//!
//! The device id is a path prefix. Frame `n` is `<prefix>{n:05}.jpg`, with
//! optional depth in `<prefix>{n:05}.exr` (float depth, rounded into 16 bits).

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::device::capture_precondition_violated;
use crate::device::contract::{Device, DeviceDescriptor, DeviceSession, DriverDescription};
use crate::frame::{CaptureFrame, ColorImage, DepthImage};
use crate::OutputMask;

fn frame_path(prefix: &str, index: u64, extension: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}{index:05}.{extension}"))
}

fn load_color(path: &Path) -> Result<ColorImage> {
    let rgb = image::open(path)
        .with_context(|| format!("decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut data = rgb.into_raw();
    for pixel in data.chunks_exact_mut(ColorImage::CHANNELS) {
        pixel.swap(0, 2);
    }
    ColorImage::new(width, height, data)
}

fn load_depth(path: &Path) -> Result<DepthImage> {
    let luma = image::open(path)
        .with_context(|| format!("decode {}", path.display()))?
        .to_luma32f();
    let (width, height) = luma.dimensions();
    let samples = luma
        .into_raw()
        .into_iter()
        .map(|value| value.round().clamp(0.0, f32::from(u16::MAX)) as u16)
        .collect();
    DepthImage::new(width, height, samples)
}

struct Folder {
    prefix: String,
    has_depth: bool,
    opened_at: Instant,
    cursor: u64,
}

#[derive(Default)]
pub struct ImageFolderDevice {
    descriptor: Option<DeviceDescriptor>,
    session: Option<DeviceSession>,
    folder: Option<Folder>,
}

impl ImageFolderDevice {
    pub const DRIVER: &'static str = "CVImageCapture";

    pub fn new() -> Self {
        Self::default()
    }

    fn capture(&mut self, with_depth: bool) -> CaptureFrame {
        let Some(folder) = self.folder.as_mut() else {
            capture_precondition_violated(Self::DRIVER)
        };
        let timestamp = folder.opened_at.elapsed().as_secs_f64();
        let index = folder.cursor;
        folder.cursor += 1;

        let color_path = frame_path(&folder.prefix, index, "jpg");
        if !color_path.is_file() {
            log::debug!("{}: no frame at {}", Self::DRIVER, color_path.display());
            return if with_depth {
                CaptureFrame::empty_color_depth(timestamp)
            } else {
                CaptureFrame::empty_color(timestamp)
            };
        }
        let color = load_color(&color_path).unwrap_or_else(|err| {
            log::warn!("{}: {:#}", Self::DRIVER, err);
            ColorImage::empty()
        });
        if !with_depth {
            return CaptureFrame::color(color, timestamp);
        }
        if !folder.has_depth {
            return CaptureFrame::empty_color_depth(timestamp);
        }
        let depth_path = frame_path(&folder.prefix, index, "exr");
        let depth = load_depth(&depth_path).unwrap_or_else(|err| {
            log::warn!("{}: {:#}", Self::DRIVER, err);
            DepthImage::empty()
        });
        CaptureFrame::color_depth(color, depth, timestamp)
    }
}

impl Device for ImageFolderDevice {
    fn driver(&self) -> &'static str {
        Self::DRIVER
    }

    fn create_instance(&self) -> Box<dyn Device> {
        Box::new(Self::new())
    }

    fn init(&mut self, descriptor: DeviceDescriptor) -> Result<()> {
        if self.session.is_some() {
            self.stop();
        }
        self.descriptor = Some(descriptor.clone());

        let prefix = descriptor.device_id.clone();
        let first = frame_path(&prefix, 0, "jpg");
        if !first.is_file() {
            return Err(anyhow!("first frame {} does not exist", first.display()));
        }
        let calibration = descriptor
            .load_calibration()?
            .ok_or_else(|| anyhow!("{} requires a calibration file", Self::DRIVER))?;

        let color = load_color(&first)?;
        let depth_path = frame_path(&prefix, 0, "exr");
        let has_depth = depth_path.is_file();
        if has_depth {
            let depth = load_depth(&depth_path)?;
            if (depth.width, depth.height) != (color.width, color.height) {
                return Err(anyhow!(
                    "depth frames are {}x{} but colour frames are {}x{}",
                    depth.width,
                    depth.height,
                    color.width,
                    color.height
                ));
            }
        }
        let outputs = if has_depth {
            OutputMask::COLOR_DEPTH
        } else {
            OutputMask::COLOR
        };

        log::info!(
            "{}: opened {} ({}x{}, outputs {})",
            Self::DRIVER,
            prefix,
            color.width,
            color.height,
            outputs
        );
        self.session = Some(DeviceSession::new(
            outputs,
            color.width,
            color.height,
            calibration,
        ));
        self.folder = Some(Folder {
            prefix,
            has_depth,
            opened_at: Instant::now(),
            cursor: 0,
        });
        Ok(())
    }

    fn capture_images(&mut self) -> CaptureFrame {
        self.capture(false)
    }

    fn capture_images_with_depth(&mut self) -> CaptureFrame {
        self.capture(true)
    }

    fn stop(&mut self) {
        self.folder = None;
        self.session = None;
    }

    fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    fn describe(&self) -> DriverDescription {
        DriverDescription {
            driver: Self::DRIVER.to_string(),
            grammar: vec![
                "<folder>/<prefix> (reads <prefix>00000.jpg, <prefix>00001.jpg, ...)".to_string(),
                "depth is read from <prefix>NNNNN.exr when <prefix>00000.exr exists".to_string(),
                "requires a calibration file".to_string(),
            ],
            devices: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationProfile;
    use image::{Rgb, Rgb32FImage, RgbImage};
    use tempfile::TempDir;

    fn folder_with_frames(dir: &Path, frames: u64, depth: bool) -> Result<String> {
        let prefix = dir.join("cam_").to_string_lossy().into_owned();
        for index in 0..frames {
            RgbImage::from_pixel(4, 3, Rgb([200, 100, 50])).save(frame_path(&prefix, index, "jpg"))?;
            if depth {
                Rgb32FImage::from_pixel(4, 3, Rgb([1234.0, 1234.0, 1234.0]))
                    .save(frame_path(&prefix, index, "exr"))?;
            }
        }
        Ok(prefix)
    }

    fn calibration_file(dir: &Path) -> Result<PathBuf> {
        let path = dir.join("calib.json");
        CalibrationProfile::from_pinhole(3.0, 3.0, 2.0, 1.5, vec![0.0; 5], 4, 3).save(&path)?;
        Ok(path)
    }

    #[test]
    fn reads_numbered_colour_and_depth() -> Result<()> {
        let dir = TempDir::new()?;
        let prefix = folder_with_frames(dir.path(), 2, true)?;
        let descriptor = DeviceDescriptor::new(ImageFolderDevice::DRIVER, prefix)
            .with_calibration_file(calibration_file(dir.path())?);

        let mut device = ImageFolderDevice::new();
        device.init(descriptor)?;
        assert!(device.supports_output(OutputMask::COLOR_DEPTH));
        assert_eq!((device.width(), device.height()), (4, 3));
        assert_eq!(device.calibration().fx(), 3.0);

        let frame = device.capture_images_with_depth();
        assert!(!frame.is_empty());
        let depth = frame.depth.expect("depth requested");
        assert_eq!(depth.sample(1, 1), Some(1234));

        assert!(!device.capture_images().is_empty());
        // Unbounded: a missing frame is an empty frame, not an error.
        assert!(device.capture_images_with_depth().is_empty());
        Ok(())
    }

    #[test]
    fn init_requires_first_frame_and_calibration() -> Result<()> {
        let dir = TempDir::new()?;
        let mut device = ImageFolderDevice::new();

        let missing = dir.path().join("none_").to_string_lossy().into_owned();
        let descriptor = DeviceDescriptor::new(ImageFolderDevice::DRIVER, missing)
            .with_calibration_file(calibration_file(dir.path())?);
        assert!(device.init(descriptor).is_err());

        let prefix = folder_with_frames(dir.path(), 1, false)?;
        assert!(device
            .init(DeviceDescriptor::new(ImageFolderDevice::DRIVER, prefix))
            .is_err());
        assert!(device.session().is_none());
        Ok(())
    }
}
