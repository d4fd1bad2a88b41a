//! Frame sources and RGB-D pipelines.
//!
//! Sequential drivers pull decoded frames from `FrameSource`s:
//! - Synthetic `stub://` sources (testing)
//! - Image sequences and still images (`image` crate)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - USB/V4L2 cameras addressed by index (feature: ingest-v4l2)
//!
//! Asynchronous drivers receive pushed framesets from an `RgbdPipeline`
//! (see `pipeline`), with a synthetic pipeline for `stub://` ids.
//!
//! Every source yields BGR8 colour images. Decoding stays inside the source;
//! drivers only see `ColorImage`s.

use anyhow::{anyhow, Result};

use crate::frame::ColorImage;

#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod image_seq;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod pipeline;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use image_seq::ImageSequenceSource;
pub use pipeline::{
    Frameset, PipelineConfig, PipelineProvider, PipelineUnit, RgbdPipeline, SensorOptions,
    StreamData, StreamFrame, StreamIntrinsics, StreamKind, StreamProfile, UnitCallback,
};
pub use synthetic::{SyntheticPipelineProvider, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Pull-based decoded frame source.
pub trait FrameSource: Send {
    /// Resolution of every frame this source yields.
    fn resolution(&self) -> (u32, u32);

    /// Total frames, when the container knows it.
    fn frame_count(&self) -> Option<u64>;

    /// Next frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<ColorImage>>;
}

/// Opens sub-source paths for a sequential driver.
pub trait SourceOpener: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>>;

    /// Identifier forms this opener accepts, for operator discovery.
    fn grammar(&self) -> Vec<String>;
}

/// Opener behind the `CVVideoCapture` driver: every source kind compiled in.
#[derive(Clone, Copy, Debug, Default)]
pub struct VideoCaptureOpener;

impl SourceOpener for VideoCaptureOpener {
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>> {
        if path.starts_with("stub://") {
            return Ok(Box::new(SyntheticSource::open(path)?));
        }
        if !is_local_path(path) {
            return Err(anyhow!(
                "'{}': only local paths and camera indices are supported",
                path
            ));
        }
        if path.bytes().all(|b| b.is_ascii_digit()) {
            return open_camera_index(path);
        }
        if image_seq::is_image_path(path) {
            return Ok(Box::new(ImageSequenceSource::open(path)?));
        }
        open_video_file(path)
    }

    fn grammar(&self) -> Vec<String> {
        let mut lines = sequential_grammar();
        lines.push("<path to image file sequence> (e.g. img_%02d.jpg starting from 0)".to_string());
        lines.push("<camera index> (live V4L2 camera, feature ingest-v4l2)".to_string());
        lines
    }
}

/// Opener behind the `FFMPEG` driver: decoded video files only.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegOpener;

impl SourceOpener for FfmpegOpener {
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>> {
        if path.starts_with("stub://") {
            return Ok(Box::new(SyntheticSource::open(path)?));
        }
        if !is_local_path(path) {
            return Err(anyhow!("'{}': only local video files are supported", path));
        }
        open_video_file(path)
    }

    fn grammar(&self) -> Vec<String> {
        sequential_grammar()
    }
}

fn sequential_grammar() -> Vec<String> {
    vec![
        "<path to video file> (assumes RGB)".to_string(),
        "<path to video file>#RGB (processes as RGB)".to_string(),
        "<path to video file>#Depth (processes as depth image)".to_string(),
        "<video 1>#RGB;<video 2>#Depth (colour and depth, same resolution)".to_string(),
        "<video 1>#RGB;<video 2>#Depth;<frames>#Frames (frames: count or file holding it)"
            .to_string(),
        "stub://<name>?width=W&height=H&frames=N (synthetic source)".to_string(),
    ]
}

fn is_local_path(path: &str) -> bool {
    !path.trim().is_empty() && !path.contains("://")
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_video_file(path: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(file_ffmpeg::FfmpegFileSource::open(path)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_video_file(path: &str) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "'{}': video file decoding requires the ingest-file-ffmpeg feature",
        path
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_camera_index(index: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::open(&format!("/dev/video{index}"))?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_camera_index(index: &str) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "camera {}: live capture requires the ingest-v4l2 feature",
        index
    ))
}
