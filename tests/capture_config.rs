use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use calib_capture::config::CaptureConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "CAPTURE_DRIVER",
        "CAPTURE_DEVICE_ID",
        "CAPTURE_CALIBRATION_FILE",
        "CAPTURE_FRAME_TIMEOUT_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let calibration = NamedTempFile::new().expect("temp calibration");
    let mut file = NamedTempFile::new().expect("temp config");
    let json = format!(
        r#"{{
            "device": {{
                "driver": "RealSense2",
                "id": "stub://rig?fps=60",
                "calibration_file": "{}",
                "properties": {{ "auto-white-balance": "0", "white-balance": "4600" }}
            }},
            "sync": {{ "frame_timeout_ms": 500 }}
        }}"#,
        calibration.path().display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_DEVICE_ID", "8123");
    std::env::set_var("CAPTURE_FRAME_TIMEOUT_MS", "750");

    let cfg = CaptureConfig::load().expect("load config");

    assert_eq!(cfg.driver, "RealSense2");
    assert_eq!(cfg.device_id, "8123");
    assert_eq!(cfg.calibration_file.as_deref(), Some(calibration.path()));
    assert_eq!(cfg.frame_timeout, Some(Duration::from_millis(750)));

    let properties = cfg.device_properties();
    assert_eq!(properties.get("white-balance").map(String::as_str), Some("4600"));
    assert_eq!(
        properties.get("frame-timeout-ms").map(String::as_str),
        Some("750")
    );

    clear_env();
}

#[test]
fn toml_config_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(
        &mut file,
        b"[device]\ndriver = \"FFMPEG\"\nid = \"stub://clip?frames=3\"\n",
    )
    .expect("write config");
    std::env::set_var("CAPTURE_CONFIG", file.path());

    let cfg = CaptureConfig::load().expect("load config");
    assert_eq!(cfg.driver, "FFMPEG");
    assert_eq!(cfg.device_id, "stub://clip?frames=3");
    assert_eq!(cfg.frame_timeout, None);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CaptureConfig::load().expect("load config");
    assert_eq!(cfg.driver, "CVVideoCapture");
    assert_eq!(cfg.device_id, "stub://default");
    assert!(cfg.calibration_file.is_none());
    assert!(cfg.device_properties().is_empty());

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAPTURE_FRAME_TIMEOUT_MS", "soon");
    assert!(CaptureConfig::load().is_err());
    std::env::set_var("CAPTURE_FRAME_TIMEOUT_MS", "0");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_CALIBRATION_FILE", "/nonexistent/calib.json");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ \"device\": ").expect("write config");
    std::env::set_var("CAPTURE_CONFIG", file.path());
    assert!(CaptureConfig::load().is_err());

    clear_env();
}
