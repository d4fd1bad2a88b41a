mod contract;
pub mod drivers;
pub mod identifier;
mod registry;

pub(crate) use contract::capture_precondition_violated;
pub use contract::{
    Device, DeviceDescriptor, DeviceProperties, DeviceSession, DriverDescription, MotionHandler,
};
pub use drivers::{ImageFolderDevice, RgbdDevice, SequentialDevice};
pub use registry::{DeviceRegistry, RegistryError};
