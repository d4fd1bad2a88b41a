//! Still images and printf-style image sequences (`img_%05d.png`).
//!
//! Frames are decoded with the `image` crate and converted to BGR8.
//! A sequence starts at the first existing index in 0..=4 and ends at the
//! first missing file.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::FrameSource;
use crate::frame::ColorImage;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];
const MAX_START_INDEX: u64 = 4;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"%(0?)(\d*)d").expect("static regex"))
}

/// True for paths the image decoder should handle rather than a video decoder.
pub fn is_image_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SequenceKind {
    Still(PathBuf),
    Pattern { pattern: String, start: u64 },
}

/// Expand the first `%d` / `%0Nd` placeholder of `pattern` with `index`.
fn expand(pattern: &str, index: u64) -> String {
    placeholder()
        .replace(pattern, |caps: &regex::Captures<'_>| {
            let width: usize = caps[2].parse().unwrap_or(0);
            if &caps[1] == "0" {
                format!("{index:0width$}")
            } else {
                format!("{index:width$}")
            }
        })
        .into_owned()
}

pub struct ImageSequenceSource {
    kind: SequenceKind,
    width: u32,
    height: u32,
    frames: u64,
    cursor: u64,
}

impl ImageSequenceSource {
    pub fn open(path: &str) -> Result<Self> {
        let kind = if placeholder().is_match(path) {
            let start = (0..=MAX_START_INDEX)
                .find(|index| Path::new(&expand(path, *index)).is_file())
                .ok_or_else(|| anyhow!("image sequence '{}': no frame found", path))?;
            SequenceKind::Pattern {
                pattern: path.to_string(),
                start,
            }
        } else {
            if !Path::new(path).is_file() {
                return Err(anyhow!("image '{}' does not exist", path));
            }
            SequenceKind::Still(PathBuf::from(path))
        };

        let frames = match &kind {
            SequenceKind::Still(_) => 1,
            SequenceKind::Pattern { pattern, start } => (*start..)
                .take_while(|index| Path::new(&expand(pattern, *index)).is_file())
                .count() as u64,
        };

        let mut source = Self {
            kind,
            width: 0,
            height: 0,
            frames,
            cursor: 0,
        };
        let first = source.load(0)?;
        source.width = first.width;
        source.height = first.height;
        log::info!(
            "ImageSequenceSource: opened {} ({}x{}, {} frames)",
            path,
            source.width,
            source.height,
            frames
        );
        Ok(source)
    }

    fn frame_path(&self, offset: u64) -> PathBuf {
        match &self.kind {
            SequenceKind::Still(path) => path.clone(),
            SequenceKind::Pattern { pattern, start } => PathBuf::from(expand(pattern, start + offset)),
        }
    }

    fn load(&self, offset: u64) -> Result<ColorImage> {
        let path = self.frame_path(offset);
        let rgb = image::open(&path)
            .with_context(|| format!("decode {}", path.display()))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        let mut data = rgb.into_raw();
        for pixel in data.chunks_exact_mut(ColorImage::CHANNELS) {
            pixel.swap(0, 2);
        }
        ColorImage::new(width, height, data)
    }
}

impl FrameSource for ImageSequenceSource {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.frames)
    }

    fn read_frame(&mut self) -> Result<Option<ColorImage>> {
        if self.cursor >= self.frames {
            return Ok(None);
        }
        let image = self.load(self.cursor)?;
        self.cursor += 1;
        if (image.width, image.height) != (self.width, self.height) {
            return Err(anyhow!(
                "{}: frame size {}x{} differs from sequence size {}x{}",
                self.frame_path(self.cursor - 1).display(),
                image.width,
                image.height,
                self.width,
                self.height
            ));
        }
        Ok(Some(image))
    }
}
