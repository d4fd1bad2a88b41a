use anyhow::{anyhow, Result};

use crate::frame::ColorImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
}

/// Decode one mmap buffer into a BGR8 image. Trailing padding is ignored.
pub(crate) fn buffer_to_color(
    buffer: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<ColorImage> {
    let pixels = (width as usize)
        .checked_mul(height as usize)
        .filter(|&pixels| pixels > 0)
        .ok_or_else(|| anyhow!("cannot decode a {}x{} frame", width, height))?;
    let needed = match format {
        PixelFormat::Rgb24 => pixels.checked_mul(3),
        PixelFormat::Nv12 => pixels.checked_add(pixels / 2),
    }
    .ok_or_else(|| anyhow!("{}x{} frame is too large", width, height))?;
    if format == PixelFormat::Nv12 && (width % 2 != 0 || height % 2 != 0) {
        return Err(anyhow!("NV12 needs even dimensions, got {}x{}", width, height));
    }
    let buffer = buffer.get(..needed).ok_or_else(|| {
        anyhow!(
            "{:?} buffer holds {} bytes, {}x{} needs {}",
            format,
            buffer.len(),
            width,
            height,
            needed
        )
    })?;

    let bgr = match format {
        PixelFormat::Rgb24 => buffer
            .chunks_exact(3)
            .flat_map(|rgb| [rgb[2], rgb[1], rgb[0]])
            .collect(),
        PixelFormat::Nv12 => nv12_rows_to_bgr(buffer, width as usize, height as usize),
    };
    ColorImage::new(width, height, bgr)
}

/// BT.601 full range, 8.8 fixed point. Chroma is shared by 2x2 blocks.
fn nv12_rows_to_bgr(buffer: &[u8], width: usize, height: usize) -> Vec<u8> {
    let (luma, chroma) = buffer.split_at(width * height);
    let mut bgr = Vec::with_capacity(width * height * 3);
    for (row, luma_row) in luma.chunks_exact(width).enumerate() {
        let chroma_row = &chroma[(row / 2) * width..];
        for (col, &y) in luma_row.iter().enumerate() {
            let y = i32::from(y);
            let u = i32::from(chroma_row[col & !1]) - 128;
            let v = i32::from(chroma_row[(col & !1) + 1]) - 128;
            bgr.push(saturate(y + ((454 * u) >> 8)));
            bgr.push(saturate(y - ((88 * u + 183 * v) >> 8)));
            bgr.push(saturate(y + ((359 * v) >> 8)));
        }
    }
    debug_assert_eq!(bgr.len(), height * width * 3);
    bgr
}

fn saturate(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_keeps_luma() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let image = buffer_to_color(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(image.as_bytes(), &[128u8; 12][..]);
        Ok(())
    }

    #[test]
    fn strong_v_pushes_towards_red() -> Result<()> {
        let nv12 = [vec![100u8; 4], vec![128, 228]].concat();
        let image = buffer_to_color(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(image.pixel(1, 1), Some([100, 29, 240]));
        Ok(())
    }

    #[test]
    fn rgb_channels_are_swapped_and_padding_dropped() -> Result<()> {
        let image = buffer_to_color(&[1, 2, 3, 4, 5, 6, 0, 0], 2, 1, PixelFormat::Rgb24)?;
        assert_eq!(image.as_bytes(), &[3, 2, 1, 6, 5, 4][..]);
        assert!(buffer_to_color(&[1, 2], 1, 1, PixelFormat::Rgb24).is_err());
        Ok(())
    }
}
