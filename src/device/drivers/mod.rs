mod image_folder;
mod rgbd;
mod sequential;

pub use image_folder::ImageFolderDevice;
pub use rgbd::{RgbdDevice, FRAME_TIMEOUT_PROPERTY};
pub use sequential::{SequentialDevice, StreamState};
