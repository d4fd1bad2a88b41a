//! capture_probe - open a capture device and report what it delivers.
//!
//! Lists drivers and their addressing grammar, opens one device through the
//! registry, captures a number of frames and prints timestamps and drop
//! counts. Ctrl-C stops the loop and releases a blocked capture.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use calib_capture::config::CaptureConfig;
use calib_capture::ui::Ui;
use calib_capture::{CancelToken, DeviceRegistry, FrameCount, OutputMask};

#[derive(Parser, Debug)]
#[command(
    name = "capture_probe",
    about = "Open a capture device and report frames, timestamps and drops"
)]
struct Args {
    /// List registered drivers with their identifier grammar and exit
    #[arg(long)]
    list: bool,

    /// Driver name (e.g. CVVideoCapture, FFMPEG, CVImageCapture, RealSense2)
    #[arg(long, env = "CAPTURE_DRIVER")]
    driver: Option<String>,

    /// Device identifier in the driver's grammar
    #[arg(long, value_name = "ID", env = "CAPTURE_DEVICE_ID")]
    device: Option<String>,

    /// Open the first device the driver enumerates
    #[arg(long)]
    first: bool,

    /// Calibration file to load into the device
    #[arg(long, value_name = "PATH", env = "CAPTURE_CALIBRATION_FILE")]
    calibration: Option<PathBuf>,

    /// Device property, repeatable (e.g. --property auto-exposure=0)
    #[arg(long = "property", value_name = "KEY=VALUE")]
    properties: Vec<String>,

    /// Number of frames to capture
    #[arg(long, default_value_t = 10)]
    frames: u64,

    /// Capture colour and depth together
    #[arg(long)]
    depth: bool,

    /// Write the device calibration profile here after capturing
    #[arg(long, value_name = "PATH")]
    save_calibration: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn parse_property(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("property '{}' must be KEY=VALUE", raw))?;
    if key.trim().is_empty() {
        return Err(anyhow!("property '{}' has an empty key", raw));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let registry = DeviceRegistry::with_default_drivers();
    if args.list {
        for description in registry.list_devices() {
            println!("{}", description.driver);
            for line in &description.grammar {
                println!("    {line}");
            }
            for device in &description.devices {
                println!("    device: {device}");
            }
        }
        return Ok(());
    }

    let mut config = CaptureConfig::load()?;
    if let Some(driver) = args.driver {
        config.driver = driver;
    }
    if let Some(device_id) = args.device {
        config.device_id = device_id;
    }
    if args.calibration.is_some() {
        config.calibration_file = args.calibration;
    }
    for raw in &args.properties {
        let (key, value) = parse_property(raw)?;
        config.properties.insert(key, value);
    }

    let mut device = {
        let _stage = ui.stage("Open device");
        let created = if args.first {
            registry.create_first(&config.driver, config.calibration_file.as_deref())
        } else {
            registry.create(
                &config.driver,
                &config.device_id,
                config.device_properties(),
                config.calibration_file.as_deref(),
            )
        };
        created.with_context(|| format!("open {} device", config.driver))?
    };

    let frame_count = device.number_of_frames();
    let outputs = if device.supports_output(OutputMask::COLOR_DEPTH_IMU) {
        OutputMask::COLOR_DEPTH_IMU
    } else if device.supports_output(OutputMask::COLOR_DEPTH) {
        OutputMask::COLOR_DEPTH
    } else {
        OutputMask::COLOR
    };
    println!(
        "{} {}x{} outputs={} frames={}",
        device.driver(),
        device.width(),
        device.height(),
        outputs,
        frame_count
    );
    if args.depth && !device.supports_output(OutputMask::DEPTH) {
        return Err(anyhow!("{} does not deliver depth", device.driver()));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let token: Arc<Mutex<Option<CancelToken>>> = Arc::new(Mutex::new(device.cancel_token()));
    {
        let stop = stop.clone();
        let token = token.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
            if let Ok(token) = token.lock() {
                if let Some(token) = token.as_ref() {
                    token.cancel();
                }
            }
        })
        .context("set Ctrl-C handler")?;
    }

    let limit = match frame_count {
        FrameCount::Bounded(bound) => bound.min(args.frames),
        FrameCount::Unbounded => args.frames,
    };
    let mut captured = 0u64;
    let mut empty = 0u64;
    let mut dropped = 0u64;
    {
        let _stage = ui.stage("Capture");
        let progress = ui.frames(Some(limit));
        for index in 0..limit {
            if stop.load(Ordering::SeqCst) {
                log::info!("capture_probe: interrupted after {} frames", index);
                break;
            }
            let frame = if args.depth {
                device.capture_images_with_depth()
            } else {
                device.capture_images()
            };
            dropped += frame.dropped_frames;
            progress.frame(dropped);
            if frame.is_empty() {
                empty += 1;
                log::debug!("capture_probe: frame {} empty at {:.6}s", index, frame.timestamp);
                continue;
            }
            captured += 1;
            println!(
                "frame {:>5} t={:.6}s color={}x{} depth={} dropped={}",
                index,
                frame.timestamp,
                frame.color.width,
                frame.color.height,
                frame
                    .depth
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |d| format!("{}x{}", d.width, d.height)),
                frame.dropped_frames
            );
        }
    }
    println!("captured={captured} empty={empty} dropped={dropped}");

    if let Some(path) = &args.save_calibration {
        let _stage = ui.stage("Save calibration");
        device.calibration().save(path)?;
        log::info!("capture_probe: calibration written to {}", path.display());
    }

    // The handler may still run after the device is gone.
    if let Ok(mut token) = token.lock() {
        token.take();
    }
    device.stop();
    Ok(())
}
