//! Push-based RGB-D pipeline abstraction.
//!
//! A pipeline owns a vendor thread that delivers `PipelineUnit`s through a
//! callback: framesets (colour + depth captured together) and, independently
//! and at a higher rate, motion samples. The callback runs on the vendor
//! thread with no cooperation from the consumer.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::device::DeviceDescriptor;
use crate::frame::{ColorImage, DepthImage, MotionSample};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Color,
    Depth,
    Infrared,
    Accel,
    Gyro,
}

impl StreamKind {
    pub fn is_motion(self) -> bool {
        matches!(self, StreamKind::Accel | StreamKind::Gyro)
    }
}

/// Pinhole intrinsics reported by the sensor for a video stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub ppx: f32,
    pub ppy: f32,
    pub coeffs: [f32; 5],
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamProfile {
    /// Stable per configured stream; changes when the sensor is reconfigured.
    pub unique_id: u32,
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub intrinsics: Option<StreamIntrinsics>,
}

#[derive(Clone, Debug)]
pub enum StreamData {
    Bgr8(ColorImage),
    Z16(DepthImage),
}

#[derive(Clone, Debug)]
pub struct StreamFrame {
    pub profile: StreamProfile,
    pub data: StreamData,
}

/// Frames captured together by the sensor.
#[derive(Clone, Debug)]
pub struct Frameset {
    /// Sensor clock, milliseconds.
    pub timestamp_ms: f64,
    pub frames: Vec<StreamFrame>,
}

impl Frameset {
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_ms * 1e-3
    }

    pub fn profiles(&self) -> impl Iterator<Item = &StreamProfile> {
        self.frames.iter().map(|frame| &frame.profile)
    }

    pub fn first(&self, kind: StreamKind) -> Option<&StreamFrame> {
        self.frames.iter().find(|frame| frame.profile.kind == kind)
    }
}

pub enum PipelineUnit {
    Frameset(Frameset),
    Motion(MotionSample),
}

pub type UnitCallback = Arc<dyn Fn(PipelineUnit) + Send + Sync>;

/// Colour sensor options taken from device properties.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SensorOptions {
    /// `Some(false)` when `auto-exposure` is `"0"`.
    pub auto_exposure: Option<bool>,
    /// `Some(false)` when `auto-white-balance` is `"0"`.
    pub auto_white_balance: Option<bool>,
    pub white_balance: Option<f32>,
    pub exposure: Option<f32>,
}

impl SensorOptions {
    pub fn from_descriptor(descriptor: &DeviceDescriptor) -> Self {
        let disabled = |key: &str| (descriptor.property(key) == Some("0")).then_some(false);
        Self {
            auto_exposure: disabled("auto-exposure"),
            auto_white_balance: disabled("auto-white-balance"),
            white_balance: descriptor.parsed_property("white-balance"),
            exposure: descriptor.parsed_property("exposure"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineSource {
    /// Live device selected by serial number.
    Live { serial: String },
    /// Previously recorded session.
    Playback { path: PathBuf },
    /// No input selected; the pipeline records whatever device it picks.
    RecordOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub source: PipelineSource,
    pub streams: Vec<StreamRequest>,
    pub record_to: Option<PathBuf>,
    pub sensor_options: SensorOptions,
}

pub const LIVE_WIDTH: u32 = 1280;
pub const LIVE_HEIGHT: u32 = 720;
pub const LIVE_FPS: u32 = 30;

impl PipelineConfig {
    /// Colour + depth at 1280x720@30 plus accel and gyro.
    pub fn live(serial: &str) -> Self {
        let video = |kind| StreamRequest {
            kind,
            width: LIVE_WIDTH,
            height: LIVE_HEIGHT,
            fps: LIVE_FPS,
        };
        let motion = |kind| StreamRequest {
            kind,
            width: 0,
            height: 0,
            fps: 0,
        };
        Self {
            source: PipelineSource::Live {
                serial: serial.to_string(),
            },
            streams: vec![
                video(StreamKind::Color),
                video(StreamKind::Depth),
                motion(StreamKind::Accel),
                motion(StreamKind::Gyro),
            ],
            record_to: None,
            sensor_options: SensorOptions::default(),
        }
    }

    /// Streams as recorded in `path`.
    pub fn playback(path: &str) -> Self {
        Self {
            source: PipelineSource::Playback {
                path: PathBuf::from(path),
            },
            streams: Vec::new(),
            record_to: None,
            sensor_options: SensorOptions::default(),
        }
    }
}

/// A started or startable vendor pipeline.
pub trait RgbdPipeline: Send {
    /// Stream profiles `config` would produce, without delivering frames.
    fn resolve(&mut self, config: &PipelineConfig) -> Result<Vec<StreamProfile>>;

    /// Start streaming; `callback` runs on the pipeline's own thread.
    fn start(&mut self, config: &PipelineConfig, callback: UnitCallback)
        -> Result<Vec<StreamProfile>>;

    /// Stop streaming. After return the callback is not invoked again.
    fn stop(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineDeviceInfo {
    pub serial: String,
    pub name: String,
}

/// Entry point into a vendor SDK.
pub trait PipelineProvider: Send + Sync {
    /// Connected devices. Must not open any of them.
    fn query_devices(&self) -> Vec<PipelineDeviceInfo>;

    fn open(&self, config: &PipelineConfig) -> Result<Box<dyn RgbdPipeline>>;
}
