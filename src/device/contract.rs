use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::calibration::CalibrationProfile;
use crate::frame::{CaptureFrame, MotionSample};
use crate::sync::CancelToken;
use crate::{FrameCount, OutputMask};

/// Driver-specific key/value settings. Unknown keys are ignored by every driver.
pub type DeviceProperties = HashMap<String, String>;

/// Callback receiving motion samples on the vendor thread.
pub type MotionHandler = Box<dyn Fn(MotionSample) + Send + Sync>;

/// Everything needed to (re)open a device.
///
/// Retained by the device after `init` so `reset` can reopen the same source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Registry key of the driver.
    pub driver: String,
    /// Backend-specific address (identifier grammar, serial, path).
    pub device_id: String,
    pub properties: DeviceProperties,
    pub calibration_file: Option<PathBuf>,
}

impl DeviceDescriptor {
    pub fn new(driver: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            device_id: device_id.into(),
            properties: DeviceProperties::new(),
            calibration_file: None,
        }
    }

    pub fn with_properties(mut self, properties: DeviceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_calibration_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.calibration_file = Some(path.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parsed property value. Unparsable values are logged and ignored.
    pub fn parsed_property<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.property(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!(
                    "{}: ignoring property {}={:?} (unparsable)",
                    self.driver,
                    key,
                    raw
                );
                None
            }
        }
    }

    /// Load the calibration file, if one was supplied.
    pub fn load_calibration(&self) -> Result<Option<CalibrationProfile>> {
        match &self.calibration_file {
            Some(path) => CalibrationProfile::load(path).map(Some),
            None => Ok(None),
        }
    }
}

/// Session state fixed by a successful `init`.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSession {
    pub outputs: OutputMask,
    pub width: u32,
    pub height: u32,
    pub calibration: CalibrationProfile,
}

impl DeviceSession {
    pub fn new(outputs: OutputMask, width: u32, height: u32, calibration: CalibrationProfile) -> Self {
        Self {
            outputs,
            width,
            height,
            calibration,
        }
    }
}

/// Operator-facing description of a driver's addressing grammar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverDescription {
    pub driver: String,
    /// One line per accepted identifier form.
    pub grammar: Vec<String>,
    /// Device ids currently discoverable (live hardware only).
    pub devices: Vec<String>,
}

/// Capture device contract implemented by every driver.
///
/// Lifecycle: a prototype is registered with the `DeviceRegistry`, which hands
/// out fresh instances via `create_instance` and calls `init`. After `init`
/// succeeds, the session (outputs, resolution, calibration) is fixed until
/// `stop`.
///
/// # Preconditions
///
/// Calling `capture_images` or `capture_images_with_depth` before a successful
/// `init`, or after `stop`, is a programmer error and panics. End of stream and
/// other transient gaps are reported as empty frames instead.
pub trait Device: Send {
    /// Registry key.
    fn driver(&self) -> &'static str;

    /// Fresh, uninitialised instance of the same driver.
    fn create_instance(&self) -> Box<dyn Device>;

    /// Open the backend. The only operation allowed to fail.
    fn init(&mut self, descriptor: DeviceDescriptor) -> Result<()>;

    /// Capture colour only. `depth` of the returned frame is `None`.
    fn capture_images(&mut self) -> CaptureFrame;

    /// Capture colour and depth as one unit; both are empty when either is
    /// unavailable this cycle.
    fn capture_images_with_depth(&mut self) -> CaptureFrame;

    /// Release the backend. The descriptor is kept for `reset`.
    fn stop(&mut self);

    /// Session fixed by the last successful `init`; `None` when not ready.
    fn session(&self) -> Option<&DeviceSession>;

    /// Descriptor of the last `init` call.
    fn descriptor(&self) -> Option<&DeviceDescriptor>;

    /// Addressing grammar and discoverable devices. Never opens a device.
    fn describe(&self) -> DriverDescription;

    fn number_of_frames(&self) -> FrameCount {
        FrameCount::Unbounded
    }

    /// Register a handler for motion samples.
    fn subscribe_motion(&mut self, _handler: MotionHandler) -> Result<()> {
        Err(anyhow!("{} does not deliver motion samples", self.driver()))
    }

    /// Token that releases a blocked capture from another thread.
    fn cancel_token(&self) -> Option<CancelToken> {
        None
    }

    /// `stop` followed by `init` with the retained descriptor.
    fn reset(&mut self) -> Result<()> {
        let descriptor = self
            .descriptor()
            .cloned()
            .ok_or_else(|| anyhow!("{}: reset called before init", self.driver()))?;
        self.stop();
        self.init(descriptor)
    }

    fn supports_output(&self, outputs: OutputMask) -> bool {
        self.session()
            .is_some_and(|session| session.outputs.contains(outputs))
    }

    fn width(&self) -> u32 {
        self.session().map_or(0, |session| session.width)
    }

    fn height(&self) -> u32 {
        self.session().map_or(0, |session| session.height)
    }

    fn calibration(&self) -> CalibrationProfile {
        self.session()
            .map(|session| session.calibration.clone())
            .unwrap_or_default()
    }
}

/// Panic for a capture issued outside the ready state.
pub(crate) fn capture_precondition_violated(driver: &str) -> ! {
    panic!("{driver}: capture_images called before a successful init or after stop")
}
