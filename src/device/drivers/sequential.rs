//! Pull-based driver over decoded frame sources (`CVVideoCapture`, `FFMPEG`).
//!
//! ```text
//! Closed --init--> Opened --capture--> Streaming --cursor == bound--> Exhausted
//!    ^                                                                   |
//!    +------------------------------- stop ------------------------------+
//! ```
//!
//! Every capture call advances the frame cursor until the bound is reached;
//! once exhausted, captures return empty frames and the cursor stays put.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::calibration::CalibrationProfile;
use crate::device::contract::{Device, DeviceDescriptor, DeviceSession, DriverDescription};
use crate::device::identifier::{self, SourceRole};
use crate::device::capture_precondition_violated;
use crate::frame::{pack_bgr8_as_depth16, CaptureFrame, ColorImage};
use crate::ingest::{FfmpegOpener, FrameSource, SourceOpener, VideoCaptureOpener};
use crate::{FrameCount, OutputMask};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opened,
    Streaming,
    Exhausted,
}

struct OpenSources {
    color: Option<Box<dyn FrameSource>>,
    depth: Option<Box<dyn FrameSource>>,
    frame_limit: FrameCount,
    /// External per-frame timestamps, consumed front to back.
    timestamps: VecDeque<f64>,
    opened_at: Instant,
    cursor: u64,
}

impl OpenSources {
    /// Colour resolution, or the depth resolution for depth-only devices.
    fn resolution(&self) -> (u32, u32) {
        self.color
            .as_ref()
            .or(self.depth.as_ref())
            .map_or((0, 0), |source| source.resolution())
    }

    fn outputs(&self) -> OutputMask {
        match (self.color.is_some(), self.depth.is_some()) {
            (true, true) => OutputMask::COLOR_DEPTH,
            (false, true) => OutputMask::DEPTH,
            _ => OutputMask::COLOR,
        }
    }

    fn next_timestamp(&mut self) -> f64 {
        self.timestamps
            .pop_front()
            .unwrap_or_else(|| self.opened_at.elapsed().as_secs_f64())
    }
}

pub struct SequentialDevice {
    driver: &'static str,
    opener: Arc<dyn SourceOpener>,
    descriptor: Option<DeviceDescriptor>,
    session: Option<DeviceSession>,
    sources: Option<OpenSources>,
    state: StreamState,
}

impl SequentialDevice {
    pub fn new(driver: &'static str, opener: Arc<dyn SourceOpener>) -> Self {
        Self {
            driver,
            opener,
            descriptor: None,
            session: None,
            sources: None,
            state: StreamState::Closed,
        }
    }

    /// `CVVideoCapture`: files, image sequences, cameras and `stub://`.
    pub fn video_capture() -> Self {
        Self::new("CVVideoCapture", Arc::new(VideoCaptureOpener))
    }

    /// `FFMPEG`: decoded video files and `stub://`.
    pub fn ffmpeg() -> Self {
        Self::new("FFMPEG", Arc::new(FfmpegOpener))
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Zero-based index of the next frame to read.
    pub fn cursor(&self) -> u64 {
        self.sources.as_ref().map_or(0, |sources| sources.cursor)
    }

    fn open_sources(&self, device_id: &str) -> Result<OpenSources> {
        let specs = identifier::parse_identifier(device_id)?;
        let mut color: Option<Box<dyn FrameSource>> = None;
        let mut depth: Option<Box<dyn FrameSource>> = None;
        let mut frames_override = None;
        let mut timestamps = VecDeque::new();

        for spec in &specs {
            match spec.role {
                SourceRole::Rgb => {
                    if color.is_some() {
                        bail!("more than one colour source in '{}'", device_id);
                    }
                    let source = self
                        .opener
                        .open(&spec.path)
                        .with_context(|| format!("open colour source '{}'", spec.path))?;
                    if let Some(path) = spec.timestamps_path().filter(|path| path.is_file()) {
                        timestamps = identifier::read_timestamps(&path)?.into();
                        log::info!(
                            "{}: {} timestamps from {}",
                            self.driver,
                            timestamps.len(),
                            path.display()
                        );
                    }
                    color = Some(source);
                }
                SourceRole::Depth => {
                    if depth.is_some() {
                        bail!("more than one depth source in '{}'", device_id);
                    }
                    let source = self
                        .opener
                        .open(&spec.path)
                        .with_context(|| format!("open depth source '{}'", spec.path))?;
                    depth = Some(source);
                }
                SourceRole::Frames => match identifier::resolve_frame_limit(&spec.path)? {
                    0 => log::warn!("{}: ignoring zero frame count override", self.driver),
                    limit => frames_override = Some(limit),
                },
            }
        }

        if color.is_none() && depth.is_none() {
            bail!("'{}' names no colour or depth source", device_id);
        }
        if let (Some(color), Some(depth)) = (&color, &depth) {
            if depth.resolution() != color.resolution() {
                let (cw, ch) = color.resolution();
                let (dw, dh) = depth.resolution();
                bail!(
                    "depth source is {}x{} but colour source is {}x{}",
                    dw,
                    dh,
                    cw,
                    ch
                );
            }
        }

        let frame_limit = match frames_override {
            Some(limit) => FrameCount::Bounded(limit),
            None => [color.as_ref(), depth.as_ref()]
                .into_iter()
                .flatten()
                .map(|source| {
                    source
                        .frame_count()
                        .map_or(FrameCount::Unbounded, FrameCount::Bounded)
                })
                .fold(FrameCount::Unbounded, FrameCount::min),
        };

        Ok(OpenSources {
            color,
            depth,
            frame_limit,
            timestamps,
            opened_at: Instant::now(),
            cursor: 0,
        })
    }

    fn capture(&mut self, with_depth: bool) -> CaptureFrame {
        let driver = self.driver;
        let Some(sources) = self.sources.as_mut() else {
            capture_precondition_violated(driver)
        };
        let timestamp = sources.next_timestamp();
        let empty = || {
            if with_depth {
                CaptureFrame::empty_color_depth(timestamp)
            } else {
                CaptureFrame::empty_color(timestamp)
            }
        };

        if self.state == StreamState::Exhausted {
            return empty();
        }
        if sources
            .frame_limit
            .bound()
            .is_some_and(|bound| sources.cursor >= bound)
        {
            log::info!("{}: end of stream after {} frames", driver, sources.cursor);
            self.state = StreamState::Exhausted;
            return empty();
        }
        self.state = StreamState::Streaming;
        sources.cursor += 1;

        let color = sources
            .color
            .as_mut()
            .map(|source| read_or_empty(driver, "colour", source.as_mut()));
        // The depth source is read on every call so both stay on the same frame.
        let depth = sources
            .depth
            .as_mut()
            .map(|source| pack_bgr8_as_depth16(&read_or_empty(driver, "depth", source.as_mut())));

        // A colour+depth pair needs both streams; a depth-only device yields empty frames.
        match (color, depth) {
            (Some(color), Some(depth)) if with_depth => {
                CaptureFrame::color_depth(color, depth, timestamp)
            }
            (Some(color), _) if !with_depth => CaptureFrame::color(color, timestamp),
            _ => empty(),
        }
    }
}

fn read_or_empty(driver: &str, role: &str, source: &mut dyn FrameSource) -> ColorImage {
    match source.read_frame() {
        Ok(Some(image)) => image,
        Ok(None) => ColorImage::empty(),
        Err(err) => {
            log::warn!("{}: failed to read {} frame: {:#}", driver, role, err);
            ColorImage::empty()
        }
    }
}

impl Device for SequentialDevice {
    fn driver(&self) -> &'static str {
        self.driver
    }

    fn create_instance(&self) -> Box<dyn Device> {
        Box::new(Self::new(self.driver, self.opener.clone()))
    }

    fn init(&mut self, descriptor: DeviceDescriptor) -> Result<()> {
        if self.session.is_some() {
            self.stop();
        }
        self.descriptor = Some(descriptor.clone());

        // Everything is opened before anything is exposed.
        let sources = self.open_sources(&descriptor.device_id)?;
        let (width, height) = sources.resolution();
        let calibration = match descriptor.load_calibration()? {
            Some(profile) if (profile.width, profile.height) != (width, height) => {
                log::warn!(
                    "{}: calibration is for {}x{}, source is {}x{}; rescaling",
                    self.driver,
                    profile.width,
                    profile.height,
                    width,
                    height
                );
                profile.scaled_to(width, height)?
            }
            Some(profile) => profile,
            None => CalibrationProfile::uncalibrated(width, height),
        };
        let outputs = sources.outputs();

        log::info!(
            "{}: opened '{}' ({}x{}, outputs {}, frames {})",
            self.driver,
            descriptor.device_id,
            width,
            height,
            outputs,
            sources.frame_limit
        );
        self.session = Some(DeviceSession::new(outputs, width, height, calibration));
        self.sources = Some(sources);
        self.state = StreamState::Opened;
        Ok(())
    }

    fn capture_images(&mut self) -> CaptureFrame {
        self.capture(false)
    }

    fn capture_images_with_depth(&mut self) -> CaptureFrame {
        self.capture(true)
    }

    fn stop(&mut self) {
        if self.sources.take().is_some() {
            log::debug!("{}: closed", self.driver);
        }
        self.session = None;
        self.state = StreamState::Closed;
    }

    fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    fn describe(&self) -> DriverDescription {
        DriverDescription {
            driver: self.driver.to_string(),
            grammar: self.opener.grammar(),
            devices: Vec::new(),
        }
    }

    fn number_of_frames(&self) -> FrameCount {
        self.sources
            .as_ref()
            .map_or(FrameCount::Unbounded, |sources| sources.frame_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::unpack_depth16_to_bg;

    fn open(device_id: &str) -> SequentialDevice {
        let mut device = SequentialDevice::video_capture();
        device
            .init(DeviceDescriptor::new("CVVideoCapture", device_id))
            .expect("init");
        device
    }

    #[test]
    fn colour_and_depth_sources_share_a_cursor() {
        let mut device = open(
            "stub://c?width=4&height=2&frames=5#RGB;stub://d?width=4&height=2&frames=3#Depth",
        );
        assert_eq!(device.number_of_frames(), FrameCount::Bounded(3));
        assert!(device.supports_output(OutputMask::COLOR_DEPTH));
        assert_eq!(device.state(), StreamState::Opened);

        for _ in 0..3 {
            let frame = device.capture_images_with_depth();
            assert!(!frame.is_empty());
            assert!(frame.depth.as_ref().is_some_and(|d| !d.is_empty()));
        }
        assert_eq!(device.state(), StreamState::Streaming);

        for _ in 0..2 {
            let frame = device.capture_images_with_depth();
            assert!(frame.is_empty());
            assert!(frame.depth.as_ref().is_some_and(|d| d.is_empty()));
            assert_eq!(device.cursor(), 3);
        }
        assert_eq!(device.state(), StreamState::Exhausted);
    }

    #[test]
    fn depth_source_is_repacked_bit_exact() {
        let mut device =
            open("stub://c?width=3&height=1&frames=1#RGB;stub://d?width=3&height=1&frames=1#Depth");
        let frame = device.capture_images_with_depth();
        let depth = frame.depth.expect("depth requested");

        // stub frame 0 is the byte ramp 0, 1, 2, ...
        let pairs = unpack_depth16_to_bg(&depth);
        assert_eq!(pairs, vec![[0, 1], [3, 4], [6, 7]]);
        assert_eq!(depth.sample(0, 0), Some(0x0100));
    }

    #[test]
    fn colour_only_device_returns_empty_pair_for_depth() {
        let mut device = open("stub://c?width=2&height=2");
        assert_eq!(device.number_of_frames(), FrameCount::Unbounded);
        assert!(!device.supports_output(OutputMask::DEPTH));

        let frame = device.capture_images_with_depth();
        assert!(frame.is_empty());
        assert!(frame.depth.as_ref().is_some_and(|d| d.is_empty()));

        let frame = device.capture_images();
        assert!(!frame.is_empty());
        assert!(frame.depth.is_none());
    }

    #[test]
    fn depth_only_identifier_reports_depth_output() {
        let mut device = open("stub://d?width=4&height=2&frames=3#Depth");
        assert_eq!((device.width(), device.height()), (4, 2));
        assert_eq!(device.number_of_frames(), FrameCount::Bounded(3));
        assert!(device.supports_output(OutputMask::DEPTH));
        assert!(!device.supports_output(OutputMask::COLOR));

        // Neither call can produce a colour image, so both come back empty.
        let frame = device.capture_images();
        assert!(frame.is_empty());
        assert!(frame.depth.is_none());
        let frame = device.capture_images_with_depth();
        assert!(frame.is_empty());
        assert!(frame.depth.as_ref().is_some_and(|d| d.is_empty()));

        device.capture_images_with_depth();
        assert_eq!(device.cursor(), 3);
        device.capture_images_with_depth();
        assert_eq!(device.state(), StreamState::Exhausted);
    }

    #[test]
    fn frames_override_wins_over_source_counts() {
        let device = open("stub://c?width=2&height=2&frames=10;4#Frames");
        assert_eq!(device.number_of_frames(), FrameCount::Bounded(4));

        let device = open("stub://c?width=2&height=2&frames=10;0#Frames");
        assert_eq!(device.number_of_frames(), FrameCount::Bounded(10));
    }

    #[test]
    fn init_fails_without_partial_device() {
        let mut device = SequentialDevice::video_capture();
        for id in [
            "stub://c?width=2&height=2;stub://d?width=4&height=2#Depth",
            "stub://c?width=2&height=2;missing.txt#Frames",
            "stub://c;stub://c2",
            "rtsp://camera/stream",
        ] {
            assert!(
                device
                    .init(DeviceDescriptor::new("CVVideoCapture", id))
                    .is_err(),
                "{id} should fail"
            );
            assert!(device.session().is_none());
        }
    }

    #[test]
    fn reset_reproduces_session() -> Result<()> {
        let mut device = open("stub://c?width=8&height=6&frames=2#RGB;stub://d?width=8&height=6#Depth");
        let before = device.session().cloned().expect("session");
        device.capture_images();
        device.reset()?;
        let after = device.session().cloned().expect("session");
        assert_eq!(before, after);
        assert_eq!(device.cursor(), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "before a successful init")]
    fn capture_after_stop_panics() {
        let mut device = open("stub://c?width=2&height=2");
        device.stop();
        device.capture_images();
    }
}
