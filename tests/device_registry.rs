//! Registry-level scenarios for the sequential drivers.
//!
//! These tests verify that:
//! 1. Composite identifiers assign colour, depth and frame-count roles
//! 2. A sibling `<stem>_timestamps.txt` overrides computed timestamps
//! 3. `reset` reproduces the capability mask and resolution
//! 4. Unknown drivers and failed `init` calls never hand out a device

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::sync::Arc;
use tempfile::TempDir;

use calib_capture::device::SequentialDevice;
use calib_capture::ingest::{FrameSource, SourceOpener};
use calib_capture::{
    CalibrationProfile, ColorImage, DeviceProperties, DeviceRegistry, FrameCount, OutputMask,
    RegistryError,
};

/// Decoder stand-in: every `.mp4` path is a 640x480 clip of 400 frames.
struct FakeVideoOpener;

struct FakeClip {
    remaining: u64,
}

impl FrameSource for FakeClip {
    fn resolution(&self) -> (u32, u32) {
        (640, 480)
    }

    fn frame_count(&self) -> Option<u64> {
        Some(400)
    }

    fn read_frame(&mut self) -> Result<Option<ColorImage>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        ColorImage::new(640, 480, vec![7; 640 * 480 * 3]).map(Some)
    }
}

impl SourceOpener for FakeVideoOpener {
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>> {
        if path.ends_with(".mp4") {
            Ok(Box::new(FakeClip { remaining: 400 }))
        } else {
            Err(anyhow!("cannot decode '{}'", path))
        }
    }

    fn grammar(&self) -> Vec<String> {
        vec!["<clip>.mp4".to_string()]
    }
}

fn registry_with_fake_video() -> DeviceRegistry {
    let mut registry = DeviceRegistry::with_default_drivers();
    registry.register(Box::new(SequentialDevice::new(
        "FakeVideo",
        Arc::new(FakeVideoOpener),
    )));
    registry
}

#[test]
fn composite_identifier_reports_frames_and_outputs() -> Result<()> {
    let registry = registry_with_fake_video();
    let mut device = registry.create(
        "FakeVideo",
        "cam0.mp4#RGB;cam0_d.mp4#Depth;300#Frames",
        DeviceProperties::new(),
        None,
    )?;

    assert_eq!(device.number_of_frames(), FrameCount::Bounded(300));
    assert!(device.supports_output(OutputMask::DEPTH | OutputMask::COLOR));
    assert!(!device.supports_output(OutputMask::IMU));
    assert_eq!((device.width(), device.height()), (640, 480));

    let frame = device.capture_images_with_depth();
    let depth = frame.depth.expect("depth requested");
    assert_eq!(depth.sample(0, 0), Some(u16::from_le_bytes([7, 7])));
    Ok(())
}

#[test]
fn sibling_timestamps_replace_elapsed_time() -> Result<()> {
    let dir = TempDir::new()?;
    let image_path = dir.path().join("seq.png");
    RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])).save(&image_path)?;
    std::fs::write(dir.path().join("seq_timestamps.txt"), "[0.0, 0.033, 0.066]")?;

    let registry = DeviceRegistry::with_default_drivers();
    let mut device = registry.create(
        "CVVideoCapture",
        image_path.to_str().expect("utf-8 path"),
        DeviceProperties::new(),
        None,
    )?;

    let first = device.capture_images();
    assert!(!first.is_empty());
    assert_eq!(first.color.pixel(0, 0), Some([30, 20, 10]));
    assert_eq!(first.timestamp, 0.0);
    assert_eq!(device.capture_images().timestamp, 0.033);
    assert_eq!(device.capture_images().timestamp, 0.066);

    // Queue exhausted: elapsed seconds since init, a small positive value.
    let fourth = device.capture_images().timestamp;
    assert!(fourth > 0.0);
    assert!(fourth != 0.033 && fourth != 0.066);
    Ok(())
}

#[test]
fn reset_reproduces_mask_and_resolution() -> Result<()> {
    let dir = TempDir::new()?;
    let calibration_path = dir.path().join("calib.json");
    let distortion = vec![0.1, 0.0, 0.0, 0.0, 0.0];
    CalibrationProfile::from_pinhole(500.0, 500.0, 320.0, 240.0, distortion, 640, 480)
        .save(&calibration_path)?;

    let registry = registry_with_fake_video();
    let mut device = registry.create(
        "FakeVideo",
        "cam0.mp4#RGB;cam0_d.mp4#Depth",
        DeviceProperties::new(),
        Some(calibration_path.as_path()),
    )?;
    let before = (
        device.supports_output(OutputMask::COLOR_DEPTH),
        device.width(),
        device.height(),
        device.calibration(),
    );
    for _ in 0..5 {
        device.capture_images();
    }

    device.reset()?;
    let after = (
        device.supports_output(OutputMask::COLOR_DEPTH),
        device.width(),
        device.height(),
        device.calibration(),
    );
    assert_eq!(before, after);
    assert_eq!(after.3.fx(), 500.0);
    assert_eq!(device.number_of_frames(), FrameCount::Bounded(400));
    Ok(())
}

#[test]
fn exhausted_device_keeps_returning_empty_frames() -> Result<()> {
    let registry = DeviceRegistry::with_default_drivers();
    let mut device = registry.create(
        "FFMPEG",
        "stub://clip?width=4&height=4&frames=2",
        DeviceProperties::new(),
        None,
    )?;
    assert!(!device.capture_images().is_empty());
    assert!(!device.capture_images().is_empty());
    for _ in 0..3 {
        assert!(device.capture_images().is_empty());
    }
    Ok(())
}

#[test]
fn depth_only_identifier_opens_with_depth_output() -> Result<()> {
    let registry = DeviceRegistry::with_default_drivers();
    let device = registry.create(
        "CVVideoCapture",
        "stub://d?width=4&height=2&frames=3#Depth",
        DeviceProperties::new(),
        None,
    )?;

    assert!(device.supports_output(OutputMask::DEPTH));
    assert!(!device.supports_output(OutputMask::COLOR));
    assert_eq!((device.width(), device.height()), (4, 2));
    assert_eq!(device.number_of_frames(), FrameCount::Bounded(3));
    Ok(())
}

#[test]
fn unknown_driver_and_bad_identifiers_yield_no_device() {
    let registry = registry_with_fake_video();

    assert!(matches!(
        registry.create("OpenNI2", "0", DeviceProperties::new(), None),
        Err(RegistryError::UnknownDriver(_))
    ));
    for id in [
        "cam0.mp4#IR",
        "cam0.mp4#RGB;cam0_d.avi#Depth",
        "cam0.mp4;abc#Frames",
    ] {
        assert!(
            matches!(
                registry.create("FakeVideo", id, DeviceProperties::new(), None),
                Err(RegistryError::InitFailed { .. })
            ),
            "{id} should fail"
        );
    }
}

#[test]
fn unreadable_calibration_fails_init() -> Result<()> {
    let dir = TempDir::new()?;
    let calibration_path = dir.path().join("broken.json");
    std::fs::write(&calibration_path, "{ not json")?;

    let registry = registry_with_fake_video();
    assert!(registry
        .create(
            "FakeVideo",
            "cam0.mp4",
            DeviceProperties::new(),
            Some(calibration_path.as_path()),
        )
        .is_err());
    Ok(())
}
