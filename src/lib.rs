//! Capture devices for the calibration toolchain.
//!
//! This crate gives calibration tools one pull-based capture interface over very
//! different back-ends:
//!
//! - **Sequential** drivers poll already-decoded sources (video files, image
//!   sequences, live V4L2 cameras, synthetic `stub://` sources).
//! - **Asynchronous** drivers wrap an RGB-D pipeline whose vendor thread pushes
//!   framesets and motion samples through a callback. The `sync` module turns
//!   that push stream into blocking `capture_images` calls with bounded
//!   staleness and drop accounting.
//!
//! # Module Structure
//!
//! - `device`: the `Device` contract, the `DeviceRegistry`, identifier grammar
//!   and the concrete drivers
//! - `sync`: frame synchronizer between the vendor callback thread and the consumer
//! - `ingest`: frame sources and RGB-D pipelines (synthetic, image, FFmpeg, V4L2)
//! - `frame`: image buffers, capture results, motion samples
//! - `calibration`: calibration profile and its interchange file
//! - `config`: file + environment configuration for the probe binary
//! - Core types: `OutputMask`, `FrameCount`

use std::fmt;
use std::ops::BitOr;

pub mod calibration;
pub mod config;
pub mod device;
pub mod frame;
pub mod ingest;
pub mod sync;
pub mod ui;

pub use calibration::CalibrationProfile;
pub use device::{
    Device, DeviceDescriptor, DeviceProperties, DeviceRegistry, DeviceSession,
    DriverDescription, RegistryError,
};
pub use frame::{
    pack_bgr8_as_depth16, unpack_depth16_to_bg, CaptureFrame, ColorImage, DepthImage,
    MotionKind, MotionSample,
};
pub use sync::{CancelToken, FrameSynchronizer};

// -------------------- Output Capabilities --------------------

/// Set of output kinds a device can deliver after `init`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OutputMask(u8);

impl OutputMask {
    pub const NONE: OutputMask = OutputMask(0);
    pub const COLOR: OutputMask = OutputMask(0b001);
    pub const DEPTH: OutputMask = OutputMask(0b010);
    pub const IMU: OutputMask = OutputMask(0b100);
    pub const COLOR_DEPTH: OutputMask = OutputMask(0b011);
    pub const COLOR_DEPTH_IMU: OutputMask = OutputMask(0b111);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every kind in `other` is also in `self`.
    pub fn contains(self, other: OutputMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for OutputMask {
    type Output = OutputMask;

    fn bitor(self, rhs: OutputMask) -> OutputMask {
        OutputMask(self.0 | rhs.0)
    }
}

impl fmt::Display for OutputMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(OutputMask::COLOR) {
            names.push("COLOR");
        }
        if self.contains(OutputMask::DEPTH) {
            names.push("DEPTH");
        }
        if self.contains(OutputMask::IMU) {
            names.push("IMU");
        }
        if names.is_empty() {
            return write!(f, "NONE");
        }
        write!(f, "{}", names.join("|"))
    }
}

// -------------------- Frame Counts --------------------

/// Number of frames a device will deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameCount {
    Bounded(u64),
    Unbounded,
}

impl FrameCount {
    pub fn bound(self) -> Option<u64> {
        match self {
            FrameCount::Bounded(n) => Some(n),
            FrameCount::Unbounded => None,
        }
    }

    /// The tighter of two counts.
    pub fn min(self, other: FrameCount) -> FrameCount {
        match (self, other) {
            (FrameCount::Bounded(a), FrameCount::Bounded(b)) => FrameCount::Bounded(a.min(b)),
            (FrameCount::Bounded(a), FrameCount::Unbounded)
            | (FrameCount::Unbounded, FrameCount::Bounded(a)) => FrameCount::Bounded(a),
            (FrameCount::Unbounded, FrameCount::Unbounded) => FrameCount::Unbounded,
        }
    }
}

impl fmt::Display for FrameCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameCount::Bounded(n) => write!(f, "{n}"),
            FrameCount::Unbounded => write!(f, "unbounded"),
        }
    }
}
