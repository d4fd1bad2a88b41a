//! Synthetic `stub://` sources for tests and dry runs.
//!
//! `stub://<name>?key=value&...` addresses both a pull-based `SyntheticSource`
//! and a push-based synthetic RGB-D pipeline. Recognised keys:
//!
//! - `width`, `height`: frame size (default 640x480)
//! - `frames`: number of frames before end of stream (default: unbounded)
//! - `fps`: pipeline delivery rate; `0` delivers as fast as possible (default 30)
//! - `imu`: motion samples per frame interval, alternating accel/gyro (default 4)
//! - `duplicates`: re-deliver every Nth frameset with the same timestamp
//! - `switch_after`: drop the colour stream after N framesets (reconfiguration)
//! - `no_depth`: pipeline without a depth stream

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::pipeline::{
    Frameset, PipelineConfig, PipelineDeviceInfo, PipelineProvider, PipelineSource,
    PipelineUnit, RgbdPipeline, StreamData, StreamFrame, StreamIntrinsics, StreamKind,
    StreamProfile, UnitCallback,
};
use super::FrameSource;
use crate::frame::{ColorImage, DepthImage, MotionKind, MotionSample};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_IMU_PER_FRAME: u32 = 4;
/// Sensor clock value of the first frameset, milliseconds.
const CLOCK_ORIGIN_MS: f64 = 1_000.0;

#[derive(Clone, Debug, PartialEq)]
struct StubAddress {
    name: String,
    params: HashMap<String, String>,
}

impl StubAddress {
    fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("'{}' is not a stub:// address", url))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Ok(Self {
            name: name.to_string(),
            params,
        })
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.params.get(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("stub://{}: invalid value for {}: '{}'", self.name, key, raw)),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }
}

/// Deterministic test pattern; `frame` shifts the pattern so frames differ.
fn pattern_pixels(width: u32, height: u32, frame: u64) -> Vec<u8> {
    let len = width as usize * height as usize * ColorImage::CHANNELS;
    (0..len)
        .map(|i| ((i as u64 + frame) % 256) as u8)
        .collect()
}

fn depth_ramp(width: u32, height: u32, frame: u64) -> Vec<u16> {
    let mut samples = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height as u64 {
        for x in 0..width as u64 {
            samples.push((500 + (x + y + frame) % 1500) as u16);
        }
    }
    samples
}

// ----------------------------------------------------------------------------
// Pull-based source
// ----------------------------------------------------------------------------

/// Synthetic decoded-frame source.
pub struct SyntheticSource {
    address: StubAddress,
    width: u32,
    height: u32,
    frames: Option<u64>,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn open(url: &str) -> Result<Self> {
        let address = StubAddress::parse(url)?;
        let width = address.number("width")?.unwrap_or(DEFAULT_WIDTH);
        let height = address.number("height")?.unwrap_or(DEFAULT_HEIGHT);
        let frames = address.number("frames")?;
        if width == 0 || height == 0 {
            return Err(anyhow!("stub://{}: frame size must be non-zero", address.name));
        }
        log::info!(
            "SyntheticSource: opened stub://{} ({}x{}, {} frames)",
            address.name,
            width,
            height,
            frames.map_or_else(|| "unbounded".to_string(), |n: u64| n.to_string())
        );
        Ok(Self {
            address,
            width,
            height,
            frames,
            frame_count: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }
}

impl FrameSource for SyntheticSource {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn frame_count(&self) -> Option<u64> {
        self.frames
    }

    fn read_frame(&mut self) -> Result<Option<ColorImage>> {
        if self.frames.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        let pixels = pattern_pixels(self.width, self.height, self.frame_count);
        self.frame_count += 1;
        ColorImage::new(self.width, self.height, pixels).map(Some)
    }
}

// ----------------------------------------------------------------------------
// Push-based RGB-D pipeline
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct SyntheticRig {
    width: u32,
    height: u32,
    fps: u32,
    imu_per_frame: u32,
    frames: Option<u64>,
    duplicate_every: Option<u64>,
    switch_after: Option<u64>,
    depth: bool,
}

impl Default for SyntheticRig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            imu_per_frame: DEFAULT_IMU_PER_FRAME,
            frames: None,
            duplicate_every: None,
            switch_after: None,
            depth: true,
        }
    }
}

impl SyntheticRig {
    fn from_address(address: &StubAddress) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            width: address.number("width")?.unwrap_or(defaults.width),
            height: address.number("height")?.unwrap_or(defaults.height),
            fps: address.number("fps")?.unwrap_or(defaults.fps),
            imu_per_frame: address.number("imu")?.unwrap_or(defaults.imu_per_frame),
            frames: address.number("frames")?,
            duplicate_every: address.number("duplicates")?.filter(|n: &u64| *n > 0),
            switch_after: address.number("switch_after")?,
            depth: !address.flag("no_depth"),
        })
    }

    fn intrinsics(&self) -> StreamIntrinsics {
        StreamIntrinsics {
            fx: self.width as f32 * 0.72,
            fy: self.width as f32 * 0.72,
            ppx: self.width as f32 / 2.0,
            ppy: self.height as f32 / 2.0,
            coeffs: [0.0; 5],
        }
    }

    fn video_profile(&self, unique_id: u32, kind: StreamKind) -> StreamProfile {
        StreamProfile {
            unique_id,
            kind,
            width: self.width,
            height: self.height,
            fps: self.fps,
            intrinsics: Some(self.intrinsics()),
        }
    }

    fn motion_profile(&self, unique_id: u32, kind: StreamKind) -> StreamProfile {
        StreamProfile {
            unique_id,
            kind,
            width: 0,
            height: 0,
            fps: self.fps * self.imu_per_frame / 2,
            intrinsics: None,
        }
    }

    /// Profiles before and after the configured reconfiguration.
    fn profiles(&self, reconfigured: bool) -> Vec<StreamProfile> {
        let mut profiles = Vec::new();
        if reconfigured {
            profiles.push(self.video_profile(11, StreamKind::Infrared));
        } else {
            profiles.push(self.video_profile(1, StreamKind::Color));
        }
        if self.depth {
            profiles.push(self.video_profile(if reconfigured { 12 } else { 2 }, StreamKind::Depth));
        }
        if self.imu_per_frame > 0 {
            profiles.push(self.motion_profile(3, StreamKind::Accel));
            profiles.push(self.motion_profile(4, StreamKind::Gyro));
        }
        profiles
    }

    fn frameset(&self, index: u64, timestamp_ms: f64) -> Result<Frameset> {
        let reconfigured = self.switch_after.is_some_and(|n| index >= n);
        let mut frames = Vec::new();
        for profile in self.profiles(reconfigured) {
            let data = match profile.kind {
                StreamKind::Color | StreamKind::Infrared => StreamData::Bgr8(ColorImage::new(
                    self.width,
                    self.height,
                    pattern_pixels(self.width, self.height, index),
                )?),
                StreamKind::Depth => StreamData::Z16(DepthImage::new(
                    self.width,
                    self.height,
                    depth_ramp(self.width, self.height, index),
                )?),
                StreamKind::Accel | StreamKind::Gyro => continue,
            };
            frames.push(StreamFrame { profile, data });
        }
        Ok(Frameset {
            timestamp_ms,
            frames,
        })
    }
}

/// Synthetic pipeline: a producer thread emitting framesets and motion samples.
pub struct SyntheticPipeline {
    rig: SyntheticRig,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticPipeline {
    fn new(rig: SyntheticRig) -> Self {
        Self {
            rig,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl RgbdPipeline for SyntheticPipeline {
    fn resolve(&mut self, config: &PipelineConfig) -> Result<Vec<StreamProfile>> {
        if config.record_to.is_some() {
            return Err(anyhow!("synthetic pipeline cannot record to file"));
        }
        Ok(self.rig.profiles(false))
    }

    fn start(
        &mut self,
        config: &PipelineConfig,
        callback: UnitCallback,
    ) -> Result<Vec<StreamProfile>> {
        let profiles = self.resolve(config)?;
        if self.worker.is_some() {
            return Err(anyhow!("synthetic pipeline already started"));
        }
        if config.sensor_options != Default::default() {
            log::info!(
                "SyntheticPipeline: colour sensor options {:?} (ignored)",
                config.sensor_options
            );
        }
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let rig = self.rig.clone();
        let worker = std::thread::Builder::new()
            .name("synthetic-rgbd".to_string())
            .spawn(move || {
                if let Err(err) = produce(&rig, &running, callback.as_ref()) {
                    log::error!("SyntheticPipeline: producer stopped: {}", err);
                }
            })
            .context("spawn synthetic pipeline thread")?;
        self.worker = Some(worker);
        log::info!(
            "SyntheticPipeline: streaming {}x{}@{} with {} motion samples per frame",
            self.rig.width,
            self.rig.height,
            self.rig.fps,
            self.rig.imu_per_frame
        );
        Ok(profiles)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("SyntheticPipeline: producer thread panicked");
            }
        }
    }
}

impl Drop for SyntheticPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(
    rig: &SyntheticRig,
    running: &AtomicBool,
    deliver: &(dyn Fn(PipelineUnit) + Send + Sync),
) -> Result<()> {
    let frame_interval_ms = if rig.fps == 0 {
        1000.0 / f64::from(DEFAULT_FPS)
    } else {
        1000.0 / f64::from(rig.fps)
    };
    let pause = (rig.fps > 0).then(|| Duration::from_secs_f64(frame_interval_ms / 1000.0));
    let mut rng = rand::thread_rng();
    let mut index = 0u64;

    while running.load(Ordering::SeqCst) {
        if rig.frames.is_some_and(|limit| index >= limit) {
            break;
        }
        let frame_start_ms = CLOCK_ORIGIN_MS + index as f64 * frame_interval_ms;

        for k in 0..rig.imu_per_frame {
            let offset = frame_interval_ms * f64::from(k) / f64::from(rig.imu_per_frame);
            let kind = if k % 2 == 0 {
                MotionKind::Accel
            } else {
                MotionKind::Gyro
            };
            let vector = match kind {
                MotionKind::Accel => [
                    rng.gen_range(-0.05..0.05),
                    -9.81 + rng.gen_range(-0.05..0.05),
                    rng.gen_range(-0.05..0.05),
                ],
                MotionKind::Gyro => [
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.01..0.01),
                ],
            };
            deliver(PipelineUnit::Motion(MotionSample {
                kind,
                timestamp: (frame_start_ms + offset) * 1e-3,
                vector,
            }));
        }

        let frameset = rig.frameset(index, frame_start_ms)?;
        let duplicate = rig
            .duplicate_every
            .is_some_and(|every| (index + 1) % every == 0)
            .then(|| frameset.clone());
        deliver(PipelineUnit::Frameset(frameset));
        if let Some(duplicate) = duplicate {
            deliver(PipelineUnit::Frameset(duplicate));
        }

        index += 1;
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }
    }
    log::debug!("SyntheticPipeline: producer exiting after {} framesets", index);
    Ok(())
}

/// Provider for `stub://` playback ids and a fixed list of fake serials.
#[derive(Clone, Debug, Default)]
pub struct SyntheticPipelineProvider {
    devices: Vec<PipelineDeviceInfo>,
}

impl SyntheticPipelineProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend these serials are connected.
    pub fn with_devices(serials: &[&str]) -> Self {
        Self {
            devices: serials
                .iter()
                .map(|serial| PipelineDeviceInfo {
                    serial: serial.to_string(),
                    name: "Synthetic RGB-D".to_string(),
                })
                .collect(),
        }
    }
}

impl PipelineProvider for SyntheticPipelineProvider {
    fn query_devices(&self) -> Vec<PipelineDeviceInfo> {
        self.devices.clone()
    }

    fn open(&self, config: &PipelineConfig) -> Result<Box<dyn RgbdPipeline>> {
        let rig = match &config.source {
            PipelineSource::Live { serial } => {
                if !self.devices.iter().any(|device| &device.serial == serial) {
                    return Err(anyhow!("no device found with ID '{}'", serial));
                }
                SyntheticRig::default()
            }
            PipelineSource::Playback { path } => {
                let url = path.to_string_lossy();
                if !url.starts_with("stub://") {
                    return Err(anyhow!(
                        "playback of '{}' requires a vendor SDK provider",
                        url
                    ));
                }
                SyntheticRig::from_address(&StubAddress::parse(&url)?)?
            }
            PipelineSource::RecordOnly => {
                return Err(anyhow!("synthetic pipeline cannot record to file"));
            }
        };
        Ok(Box::new(SyntheticPipeline::new(rig)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn stub_address_parses_query() -> Result<()> {
        let address = StubAddress::parse("stub://cam?width=8&height=4&no_depth")?;
        assert_eq!(address.name, "cam");
        assert_eq!(address.number::<u32>("width")?, Some(8));
        assert!(address.flag("no_depth"));
        assert!(address.number::<u32>("frames")?.is_none());
        assert!(StubAddress::parse("rtsp://cam").is_err());
        Ok(())
    }

    #[test]
    fn synthetic_source_ends_after_frame_limit() -> Result<()> {
        let mut source = SyntheticSource::open("stub://clip?width=4&height=2&frames=2")?;
        assert_eq!(source.resolution(), (4, 2));
        assert_eq!(source.frame_count(), Some(2));

        let first = source.read_frame()?.expect("first frame");
        let second = source.read_frame()?.expect("second frame");
        assert_ne!(first, second);
        assert!(source.read_frame()?.is_none());
        assert!(source.read_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn synthetic_source_rejects_bad_numbers() {
        assert!(SyntheticSource::open("stub://clip?width=abc").is_err());
        assert!(SyntheticSource::open("stub://clip?width=0").is_err());
    }

    #[test]
    fn pipeline_delivers_framesets_and_motion() -> Result<()> {
        let provider = SyntheticPipelineProvider::new();
        let config = PipelineConfig::playback("stub://rig?width=4&height=2&fps=0&frames=3&imu=2");
        let mut pipeline = provider.open(&config)?;

        let units = Arc::new(Mutex::new(Vec::new()));
        let sink = units.clone();
        pipeline.start(
            &config,
            Arc::new(move |unit: PipelineUnit| {
                let tag = match unit {
                    PipelineUnit::Frameset(fs) => format!("F{}", fs.timestamp_ms),
                    PipelineUnit::Motion(m) => format!("{:?}", m.kind),
                };
                sink.lock().unwrap().push(tag);
            }),
        )?;
        // Bounded rig: the producer exits on its own after three framesets.
        std::thread::sleep(Duration::from_millis(200));
        pipeline.stop();

        let units = units.lock().unwrap();
        let framesets = units.iter().filter(|u| u.starts_with('F')).count();
        assert_eq!(framesets, 3);
        assert_eq!(units.iter().filter(|u| *u == "Accel").count(), 3);
        assert_eq!(units.iter().filter(|u| *u == "Gyro").count(), 3);
        Ok(())
    }

    #[test]
    fn provider_reports_missing_serial() {
        let provider = SyntheticPipelineProvider::with_devices(&["111"]);
        assert!(provider.open(&PipelineConfig::live("111")).is_ok());
        assert!(provider.open(&PipelineConfig::live("222")).is_err());
        assert!(provider
            .open(&PipelineConfig::playback("/data/session.bag"))
            .is_err());
    }

    #[test]
    fn reconfigured_rig_swaps_colour_for_infrared() -> Result<()> {
        let rig = SyntheticRig::from_address(&StubAddress::parse(
            "stub://rig?width=2&height=2&switch_after=1",
        )?)?;
        let before = rig.frameset(0, 0.0)?;
        let after = rig.frameset(1, 33.0)?;
        assert!(before.first(StreamKind::Color).is_some());
        assert!(after.first(StreamKind::Color).is_none());
        assert!(after.first(StreamKind::Infrared).is_some());
        assert!(after.first(StreamKind::Depth).is_some());
        Ok(())
    }
}
