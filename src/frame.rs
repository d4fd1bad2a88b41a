//! Frame data handed to calibration tools.
//!
//! - `ColorImage`: 8-bit, 3-channel BGR image, row-major, tightly packed.
//! - `DepthImage`: 16-bit single-channel image with the same layout.
//! - `CaptureFrame`: one capture cycle (colour, optional depth, timestamp).
//! - `MotionSample`: accel/gyro reading delivered independently of frames.
//!
//! An empty image (zero width or height, no pixels) is the "nothing this cycle"
//! signal. Capture calls never fail for end-of-stream; they return empty frames.

use anyhow::{anyhow, Result};

// ----------------------------------------------------------------------------
// Images
// ----------------------------------------------------------------------------

/// 8-bit, 3-channel image in BGR channel order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorImage {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl ColorImage {
    pub const CHANNELS: usize = 3;

    /// Wrap interleaved BGR bytes. Fails when the buffer length does not match.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = pixel_count(width, height)?
            .checked_mul(Self::CHANNELS)
            .ok_or_else(|| anyhow!("colour image dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "colour image length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// BGR triple at (x, y), or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        let px = self.data.get(offset..offset + Self::CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }
}

/// 16-bit single-channel depth image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    data: Vec<u16>,
}

impl DepthImage {
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Result<Self> {
        let expected = pixel_count(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "depth image length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn samples(&self) -> &[u16] {
        &self.data
    }

    pub fn sample(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

fn pixel_count(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("image dimensions overflow"))
}

// ----------------------------------------------------------------------------
// Depth repacking
// ----------------------------------------------------------------------------

/// Reinterpret a BGR8 image carrying encoded depth as a 16-bit depth image.
///
/// The third channel is dropped; channel 0 becomes the low byte and channel 1
/// the high byte of each little-endian sample. No photometric conversion takes
/// place, so `unpack_depth16_to_bg` recovers the first two channels exactly.
pub fn pack_bgr8_as_depth16(image: &ColorImage) -> DepthImage {
    let samples = image
        .data
        .chunks_exact(ColorImage::CHANNELS)
        .map(|px| u16::from_le_bytes([px[0], px[1]]))
        .collect();
    DepthImage {
        width: image.width,
        height: image.height,
        data: samples,
    }
}

/// Inverse of `pack_bgr8_as_depth16` for the two channels it keeps.
pub fn unpack_depth16_to_bg(depth: &DepthImage) -> Vec<[u8; 2]> {
    depth.data.iter().map(|sample| sample.to_le_bytes()).collect()
}

// ----------------------------------------------------------------------------
// Capture results
// ----------------------------------------------------------------------------

/// Result of one `capture_images*` call.
///
/// When depth was requested, `depth` is `Some`, and colour and depth are either
/// both populated or both empty.
#[derive(Clone, Debug, Default)]
pub struct CaptureFrame {
    pub color: ColorImage,
    pub depth: Option<DepthImage>,
    /// Seconds, monotonic within a session.
    pub timestamp: f64,
    /// Framesets overwritten before this one was consumed.
    pub dropped_frames: u64,
}

impl CaptureFrame {
    pub fn color(color: ColorImage, timestamp: f64) -> Self {
        Self {
            color,
            depth: None,
            timestamp,
            dropped_frames: 0,
        }
    }

    pub fn color_depth(color: ColorImage, depth: DepthImage, timestamp: f64) -> Self {
        if color.is_empty() || depth.is_empty() {
            return Self::empty_color_depth(timestamp);
        }
        Self {
            color,
            depth: Some(depth),
            timestamp,
            dropped_frames: 0,
        }
    }

    pub fn empty_color(timestamp: f64) -> Self {
        Self::color(ColorImage::empty(), timestamp)
    }

    pub fn empty_color_depth(timestamp: f64) -> Self {
        Self {
            color: ColorImage::empty(),
            depth: Some(DepthImage::empty()),
            timestamp,
            dropped_frames: 0,
        }
    }

    pub fn with_dropped(mut self, dropped: u64) -> Self {
        self.dropped_frames = dropped;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.color.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Motion samples
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionKind {
    Accel,
    Gyro,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionSample {
    pub kind: MotionKind,
    /// Seconds, same clock as the framesets of the session.
    pub timestamp: f64,
    pub vector: [f32; 3],
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_image_rejects_wrong_length() {
        assert!(ColorImage::new(2, 2, vec![0u8; 11]).is_err());
        assert!(ColorImage::new(2, 2, vec![0u8; 12]).is_ok());
    }

    #[test]
    fn depth_repacking_is_bit_exact() {
        let bytes: Vec<u8> = (0..4 * 3 * 3).map(|i| (i * 37 % 256) as u8).collect();
        let image = ColorImage::new(4, 3, bytes.clone()).unwrap();

        let depth = pack_bgr8_as_depth16(&image);
        assert_eq!(depth.width, 4);
        assert_eq!(depth.height, 3);

        let recovered = unpack_depth16_to_bg(&depth);
        for (px, bg) in bytes.chunks_exact(3).zip(recovered) {
            assert_eq!(bg, [px[0], px[1]]);
        }
    }

    #[test]
    fn depth_repacking_uses_first_channel_as_low_byte() {
        let image = ColorImage::new(1, 1, vec![0x34, 0x12, 0xff]).unwrap();
        let depth = pack_bgr8_as_depth16(&image);
        assert_eq!(depth.sample(0, 0), Some(0x1234));
    }

    #[test]
    fn color_depth_frame_is_atomic() {
        let color = ColorImage::new(1, 1, vec![1, 2, 3]).unwrap();
        let frame = CaptureFrame::color_depth(color, DepthImage::empty(), 1.5);
        assert!(frame.is_empty());
        assert!(frame.depth.as_ref().is_some_and(DepthImage::is_empty));
        assert_eq!(frame.timestamp, 1.5);
    }

    #[test]
    fn pixel_lookup_is_bounds_checked() {
        let image = ColorImage::new(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(image.pixel(1, 0), Some([4, 5, 6]));
        assert_eq!(image.pixel(2, 0), None);
    }
}
