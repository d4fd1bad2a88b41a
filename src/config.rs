use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::drivers::FRAME_TIMEOUT_PROPERTY;
use crate::device::DeviceProperties;

const DEFAULT_DRIVER: &str = "CVVideoCapture";
const DEFAULT_DEVICE_ID: &str = "stub://default";

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<DeviceConfigFile>,
    sync: Option<SyncConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    driver: Option<String>,
    id: Option<String>,
    calibration_file: Option<PathBuf>,
    properties: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncConfigFile {
    frame_timeout_ms: Option<u64>,
}

/// Which device to open and how, from `CAPTURE_CONFIG` plus environment.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub driver: String,
    pub device_id: String,
    pub calibration_file: Option<PathBuf>,
    pub properties: DeviceProperties,
    /// Longest a capture call waits for an asynchronous frameset.
    pub frame_timeout: Option<Duration>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            driver: DEFAULT_DRIVER.to_string(),
            device_id: DEFAULT_DEVICE_ID.to_string(),
            calibration_file: None,
            properties: DeviceProperties::new(),
            frame_timeout: None,
        }
    }
}

impl CaptureConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let defaults = Self::default();
        let device = file.device.unwrap_or_default();
        Self {
            driver: device.driver.unwrap_or(defaults.driver),
            device_id: device.id.unwrap_or(defaults.device_id),
            calibration_file: device.calibration_file,
            properties: device.properties.unwrap_or_default(),
            frame_timeout: file
                .sync
                .and_then(|sync| sync.frame_timeout_ms)
                .map(Duration::from_millis),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(driver) = std::env::var("CAPTURE_DRIVER") {
            if !driver.trim().is_empty() {
                self.driver = driver;
            }
        }
        if let Ok(device_id) = std::env::var("CAPTURE_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                self.device_id = device_id;
            }
        }
        if let Ok(path) = std::env::var("CAPTURE_CALIBRATION_FILE") {
            if !path.trim().is_empty() {
                self.calibration_file = Some(PathBuf::from(path));
            }
        }
        if let Ok(timeout) = std::env::var("CAPTURE_FRAME_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("CAPTURE_FRAME_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.frame_timeout = Some(Duration::from_millis(millis));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.driver.trim().is_empty() {
            return Err(anyhow!("driver must not be empty"));
        }
        if self.device_id.trim().is_empty() {
            return Err(anyhow!("device id must not be empty"));
        }
        if self.frame_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(anyhow!("frame timeout must be greater than zero"));
        }
        if let Some(path) = &self.calibration_file {
            if !path.is_file() {
                return Err(anyhow!(
                    "calibration file {} does not exist",
                    path.display()
                ));
            }
        }
        Ok(())
    }

    /// Properties handed to the registry, including the frame timeout.
    pub fn device_properties(&self) -> DeviceProperties {
        let mut properties = self.properties.clone();
        if let Some(timeout) = self.frame_timeout {
            properties.insert(
                FRAME_TIMEOUT_PROPERTY.to_string(),
                timeout.as_millis().to_string(),
            );
        }
        properties
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() -> Result<()> {
        let file: CaptureConfigFile = toml::from_str(
            r#"
            [device]
            driver = "RealSense2"
            id = "8123"
            properties = { "auto-exposure" = "0" }

            [sync]
            frame_timeout_ms = 250
            "#,
        )?;
        let cfg = CaptureConfig::from_file(file);
        assert_eq!(cfg.driver, "RealSense2");
        assert_eq!(cfg.device_id, "8123");

        let properties = cfg.device_properties();
        assert_eq!(properties.get("auto-exposure").map(String::as_str), Some("0"));
        assert_eq!(
            properties.get(FRAME_TIMEOUT_PROPERTY).map(String::as_str),
            Some("250")
        );
        Ok(())
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = CaptureConfig::from_file(CaptureConfigFile::default());
        assert_eq!(cfg.driver, DEFAULT_DRIVER);
        assert_eq!(cfg.device_id, DEFAULT_DEVICE_ID);
        assert!(cfg.device_properties().is_empty());
        assert!(cfg.validate().is_ok());
    }
}
