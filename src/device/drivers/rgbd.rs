//! `RealSense2`: push-based RGB-D driver.
//!
//! The pipeline's thread feeds a `FrameSynchronizer`; capture calls block on
//! it and align depth to the colour grid after the lock is released.

use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::calibration::CalibrationProfile;
use crate::device::capture_precondition_violated;
use crate::device::contract::{
    Device, DeviceDescriptor, DeviceSession, DriverDescription, MotionHandler,
};
use crate::frame::CaptureFrame;
use crate::ingest::pipeline::{PipelineConfig, PipelineProvider, PipelineSource, RgbdPipeline};
use crate::ingest::{SensorOptions, StreamProfile};
use crate::sync::{Alignment, CancelToken, FrameSynchronizer, SyncStats};
use crate::OutputMask;

/// Property naming the consumer wait limit in milliseconds.
pub const FRAME_TIMEOUT_PROPERTY: &str = "frame-timeout-ms";

struct Streaming {
    pipeline: Box<dyn RgbdPipeline>,
    sync: FrameSynchronizer,
    frame_timeout: Option<Duration>,
    last_timestamp: f64,
}

pub struct RgbdDevice {
    provider: Arc<dyn PipelineProvider>,
    descriptor: Option<DeviceDescriptor>,
    session: Option<DeviceSession>,
    streaming: Option<Streaming>,
}

impl RgbdDevice {
    pub const DRIVER: &'static str = "RealSense2";

    pub fn new(provider: Arc<dyn PipelineProvider>) -> Self {
        Self {
            provider,
            descriptor: None,
            session: None,
            streaming: None,
        }
    }

    /// Synchronizer counters of the running session.
    pub fn sync_stats(&self) -> Option<SyncStats> {
        self.streaming.as_ref().map(|streaming| streaming.sync.stats())
    }

    fn pipeline_config(&self, descriptor: &DeviceDescriptor) -> Result<PipelineConfig> {
        let device_id = descriptor.device_id.trim();
        let record_to: Option<PathBuf> = match (descriptor.property("filename"), descriptor.property("rw")) {
            (Some(filename), Some("w")) => Some(filename.into()),
            _ => None,
        };

        let mut config = if !device_id.is_empty() && device_id.bytes().all(|b| b.is_ascii_digit()) {
            let known = self
                .provider
                .query_devices()
                .iter()
                .any(|device| device.serial == device_id);
            if !known {
                bail!("no device found with ID '{}'", device_id);
            }
            PipelineConfig::live(device_id)
        } else if !device_id.is_empty() {
            PipelineConfig::playback(device_id)
        } else if record_to.is_some() {
            let mut config = PipelineConfig::live("");
            config.source = PipelineSource::RecordOnly;
            config
        } else {
            bail!("{} needs a serial number or a recording to play back", Self::DRIVER);
        };
        if let Some(path) = &record_to {
            log::info!("{}: recording to {}", Self::DRIVER, path.display());
        }
        config.record_to = record_to;
        config.sensor_options = SensorOptions::from_descriptor(descriptor);
        Ok(config)
    }

    fn start(&self, descriptor: &DeviceDescriptor) -> Result<(Streaming, DeviceSession)> {
        let config = self.pipeline_config(descriptor)?;
        let mut pipeline = self
            .provider
            .open(&config)
            .with_context(|| format!("open pipeline for '{}'", descriptor.device_id))?;
        let sync = FrameSynchronizer::new();
        let profiles = pipeline.start(&config, sync.producer())?;

        match session_for(descriptor, &profiles) {
            Ok(session) => {
                let streaming = Streaming {
                    pipeline,
                    sync,
                    frame_timeout: descriptor
                        .parsed_property::<u64>(FRAME_TIMEOUT_PROPERTY)
                        .map(Duration::from_millis),
                    last_timestamp: 0.0,
                };
                Ok((streaming, session))
            }
            Err(err) => {
                pipeline.stop();
                Err(err)
            }
        }
    }

    fn streaming(&mut self) -> (&mut Streaming, u32, u32) {
        match (self.streaming.as_mut(), self.session.as_ref()) {
            (Some(streaming), Some(session)) => (streaming, session.width, session.height),
            _ => capture_precondition_violated(Self::DRIVER),
        }
    }
}

/// Session derived from the started profiles; the alignment target sets the
/// resolution.
fn session_for(descriptor: &DeviceDescriptor, profiles: &[StreamProfile]) -> Result<DeviceSession> {
    let alignment = Alignment::for_profiles(profiles)?;
    let target = profiles
        .iter()
        .find(|profile| profile.kind == alignment.target())
        .ok_or_else(|| anyhow!("alignment target missing from profiles"))?;
    let (width, height) = (target.width, target.height);

    let calibration = match descriptor.load_calibration()? {
        Some(profile) => profile,
        None => match target.intrinsics {
            Some(intrinsics) => CalibrationProfile::from_pinhole(
                f64::from(intrinsics.fx),
                f64::from(intrinsics.fy),
                f64::from(intrinsics.ppx),
                f64::from(intrinsics.ppy),
                intrinsics.coeffs.iter().map(|c| f64::from(*c)).collect(),
                width,
                height,
            ),
            None => CalibrationProfile::uncalibrated(width, height),
        },
    };

    let mut outputs = OutputMask::COLOR_DEPTH;
    if profiles.iter().any(|profile| profile.kind.is_motion()) {
        outputs = outputs | OutputMask::IMU;
    }
    Ok(DeviceSession::new(outputs, width, height, calibration))
}

impl Device for RgbdDevice {
    fn driver(&self) -> &'static str {
        Self::DRIVER
    }

    fn create_instance(&self) -> Box<dyn Device> {
        Box::new(Self::new(self.provider.clone()))
    }

    fn init(&mut self, descriptor: DeviceDescriptor) -> Result<()> {
        if self.streaming.is_some() {
            self.stop();
        }
        self.descriptor = Some(descriptor.clone());
        let (streaming, session) = self.start(&descriptor)?;
        log::info!(
            "{}: streaming '{}' ({}x{}, outputs {})",
            Self::DRIVER,
            descriptor.device_id,
            session.width,
            session.height,
            session.outputs
        );
        self.streaming = Some(streaming);
        self.session = Some(session);
        Ok(())
    }

    fn capture_images(&mut self) -> CaptureFrame {
        let (streaming, width, height) = self.streaming();
        let Some(pending) = streaming.sync.next_frame(streaming.frame_timeout) else {
            return CaptureFrame::empty_color(streaming.last_timestamp);
        };
        streaming.last_timestamp = pending.timestamp;
        match pending.alignment.color(&pending.frameset, width, height) {
            Ok(color) => CaptureFrame::color(color, pending.timestamp).with_dropped(pending.dropped),
            Err(err) => {
                log::warn!("{}: {:#}", Self::DRIVER, err);
                CaptureFrame::empty_color(pending.timestamp).with_dropped(pending.dropped)
            }
        }
    }

    fn capture_images_with_depth(&mut self) -> CaptureFrame {
        let (streaming, width, height) = self.streaming();
        let Some(pending) = streaming.sync.next_frame(streaming.frame_timeout) else {
            return CaptureFrame::empty_color_depth(streaming.last_timestamp);
        };
        streaming.last_timestamp = pending.timestamp;
        match pending.alignment.process(&pending.frameset, width, height) {
            Ok((color, depth)) => CaptureFrame::color_depth(color, depth, pending.timestamp)
                .with_dropped(pending.dropped),
            Err(err) => {
                log::warn!("{}: alignment failed: {:#}", Self::DRIVER, err);
                CaptureFrame::empty_color_depth(pending.timestamp).with_dropped(pending.dropped)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut streaming) = self.streaming.take() {
            streaming.sync.cancel_token().cancel();
            streaming.pipeline.stop();
            log::info!("{}: stopped", Self::DRIVER);
        }
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
                "<serial number> (live device)".to_string(),
                "<path to recording> (playback)".to_string(),
                "stub://<name>?fps=&width=&height=&imu=&duplicates=&switch_after=&frames= (synthetic)"
                    .to_string(),
                "properties: filename + rw=w (record), auto-exposure, auto-white-balance, \
                 white-balance, exposure, frame-timeout-ms"
                    .to_string(),
            ],
            devices: self
                .provider
                .query_devices()
                .into_iter()
                .map(|device| device.serial)
                .collect(),
        }
    }

    fn subscribe_motion(&mut self, handler: MotionHandler) -> Result<()> {
        if !self.supports_output(OutputMask::IMU) {
            bail!("{}: session has no motion streams", Self::DRIVER);
        }
        let streaming = self
            .streaming
            .as_ref()
            .ok_or_else(|| anyhow!("{}: not streaming", Self::DRIVER))?;
        streaming.sync.subscribe_motion(handler);
        Ok(())
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        self.streaming
            .as_ref()
            .map(|streaming| streaming.sync.cancel_token())
    }
}

impl Drop for RgbdDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
