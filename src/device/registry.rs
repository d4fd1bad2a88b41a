use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::contract::{Device, DeviceDescriptor, DeviceProperties, DriverDescription};
use super::drivers::{ImageFolderDevice, RgbdDevice, SequentialDevice};
use crate::ingest::SyntheticPipelineProvider;

#[derive(Debug)]
pub enum RegistryError {
    UnknownDriver(String),
    InitFailed {
        driver: String,
        device_id: String,
        source: anyhow::Error,
    },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::UnknownDriver(driver) => write!(f, "unknown driver '{}'", driver),
            RegistryError::InitFailed {
                driver,
                device_id,
                source,
            } => write!(
                f,
                "{} failed to initialise '{}': {:#}",
                driver, device_id, source
            ),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::UnknownDriver(_) => None,
            RegistryError::InitFailed { source, .. } => Some(source.as_ref()),
        }
    }
}

/// Driver prototypes keyed by driver name (case-sensitive).
///
/// Constructed by the caller and passed around explicitly; there is no global
/// instance.
#[derive(Default)]
pub struct DeviceRegistry {
    prototypes: BTreeMap<String, Box<dyn Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in driver. `RealSense2` uses the synthetic
    /// pipeline provider; register a prototype built around a vendor provider
    /// to replace it.
    pub fn with_default_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SequentialDevice::video_capture()));
        registry.register(Box::new(SequentialDevice::ffmpeg()));
        registry.register(Box::new(ImageFolderDevice::new()));
        registry.register(Box::new(RgbdDevice::new(Arc::new(
            SyntheticPipelineProvider::new(),
        ))));
        registry
    }

    /// Register a prototype. A later registration under the same name wins.
    pub fn register(&mut self, prototype: Box<dyn Device>) {
        let driver = prototype.driver().to_string();
        if self.prototypes.insert(driver.clone(), prototype).is_some() {
            log::debug!("DeviceRegistry: replaced driver {}", driver);
        }
    }

    /// Fresh instance of `driver`, initialised with `device_id`.
    ///
    /// A device whose `init` fails is dropped; the caller never sees it.
    pub fn create(
        &self,
        driver: &str,
        device_id: &str,
        properties: DeviceProperties,
        calibration_file: Option<&Path>,
    ) -> Result<Box<dyn Device>, RegistryError> {
        let prototype = self
            .prototypes
            .get(driver)
            .ok_or_else(|| RegistryError::UnknownDriver(driver.to_string()))?;

        let mut descriptor = DeviceDescriptor::new(driver, device_id).with_properties(properties);
        if let Some(path) = calibration_file {
            descriptor = descriptor.with_calibration_file(path);
        }

        let mut device = prototype.create_instance();
        match device.init(descriptor) {
            Ok(()) => {
                log::info!("DeviceRegistry: opened {} '{}'", driver, device_id);
                Ok(device)
            }
            Err(source) => {
                log::error!(
                    "DeviceRegistry: {} failed to open '{}': {:#}",
                    driver,
                    device_id,
                    source
                );
                Err(RegistryError::InitFailed {
                    driver: driver.to_string(),
                    device_id: device_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Open the first device `driver` currently enumerates.
    pub fn create_first(
        &self,
        driver: &str,
        calibration_file: Option<&Path>,
    ) -> Result<Box<dyn Device>, RegistryError> {
        let prototype = self
            .prototypes
            .get(driver)
            .ok_or_else(|| RegistryError::UnknownDriver(driver.to_string()))?;
        let device_id = prototype.describe().devices.into_iter().next().ok_or_else(|| {
            RegistryError::InitFailed {
                driver: driver.to_string(),
                device_id: String::new(),
                source: anyhow::anyhow!("no devices found"),
            }
        })?;
        self.create(driver, &device_id, DeviceProperties::new(), calibration_file)
    }

    /// Registered driver names, sorted.
    pub fn list_drivers(&self) -> Vec<String> {
        self.prototypes.keys().cloned().collect()
    }

    /// Addressing grammar and enumerated devices of every driver. Opens nothing.
    pub fn list_devices(&self) -> Vec<DriverDescription> {
        self.prototypes
            .values()
            .map(|prototype| prototype.describe())
            .collect()
    }

    pub fn describe(&self, driver: &str) -> Option<DriverDescription> {
        self.prototypes.get(driver).map(|prototype| prototype.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_lists_builtin_drivers() {
        let registry = DeviceRegistry::with_default_drivers();
        assert_eq!(
            registry.list_drivers(),
            vec!["CVImageCapture", "CVVideoCapture", "FFMPEG", "RealSense2"]
        );
        let descriptions = registry.list_devices();
        assert_eq!(descriptions.len(), 4);
        assert!(descriptions.iter().all(|d| !d.grammar.is_empty()));
    }

    #[test]
    fn unknown_driver_is_reported() {
        let registry = DeviceRegistry::with_default_drivers();
        let err = registry
            .create("cvvideocapture", "stub://x", DeviceProperties::new(), None)
            .err()
            .expect("driver names are case-sensitive");
        assert!(matches!(err, RegistryError::UnknownDriver(ref name) if name == "cvvideocapture"));
    }

    #[test]
    fn failed_init_yields_no_device() {
        let registry = DeviceRegistry::with_default_drivers();
        let err = registry
            .create("CVVideoCapture", "a.mp4#Bogus", DeviceProperties::new(), None)
            .err()
            .expect("unknown role must fail init");
        assert!(matches!(err, RegistryError::InitFailed { .. }));
        assert!(err.to_string().contains("CVVideoCapture"));
    }

    #[test]
    fn create_first_without_devices_fails() {
        let registry = DeviceRegistry::with_default_drivers();
        assert!(matches!(
            registry.create_first("RealSense2", None),
            Err(RegistryError::InitFailed { .. })
        ));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = DeviceRegistry::new();
        registry.register(Box::new(RgbdDevice::new(Arc::new(
            SyntheticPipelineProvider::new(),
        ))));
        registry.register(Box::new(RgbdDevice::new(Arc::new(
            SyntheticPipelineProvider::with_devices(&["42"]),
        ))));
        assert_eq!(registry.list_drivers(), vec!["RealSense2"]);
        let description = registry.describe("RealSense2").expect("registered");
        assert_eq!(description.devices, vec!["42"]);
    }
}
