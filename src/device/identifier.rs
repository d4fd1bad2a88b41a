//! Composite device identifier grammar.
//!
//! ```text
//! identifier := spec (';' spec)*
//! spec       := path ['#' role]
//! role       := "RGB" | "Depth" | "Frames"
//! ```
//!
//! A spec without a role is a colour source; when `<stem>_timestamps.txt`
//! exists next to it, its values replace computed timestamps.
//! The path of a `Frames` spec is either an integer or a file holding one.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceRole {
    Rgb,
    Depth,
    Frames,
}

impl SourceRole {
    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "RGB" => Ok(SourceRole::Rgb),
            "Depth" => Ok(SourceRole::Depth),
            "Frames" => Ok(SourceRole::Frames),
            other => Err(anyhow!("unknown source role '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSpec {
    pub path: String,
    pub role: SourceRole,
    /// False when the role defaulted to RGB.
    pub explicit_role: bool,
}

impl SourceSpec {
    /// Sibling timestamp file for untagged colour sources.
    pub fn timestamps_path(&self) -> Option<PathBuf> {
        if self.explicit_role || self.role != SourceRole::Rgb {
            return None;
        }
        let path = Path::new(&self.path);
        let stem = path.file_stem()?.to_str()?;
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        Some(parent.join(format!("{stem}_timestamps.txt")))
    }
}

/// Split an identifier into role-tagged sub-sources.
pub fn parse_identifier(identifier: &str) -> Result<Vec<SourceSpec>> {
    if identifier.trim().is_empty() {
        return Err(anyhow!("device identifier is empty"));
    }
    identifier
        .split(';')
        .map(|part| {
            let (path, role, explicit_role) = match part.split_once('#') {
                Some((path, tag)) => (path, SourceRole::parse(tag)?, true),
                None => (part, SourceRole::Rgb, false),
            };
            if path.is_empty() {
                return Err(anyhow!("sub-source '{}' has an empty path", part));
            }
            Ok(SourceSpec {
                path: path.to_string(),
                role,
                explicit_role,
            })
        })
        .collect()
}

/// Frame count named by a `Frames` spec: a literal integer or a file holding one.
pub fn resolve_frame_limit(path: &str) -> Result<u64> {
    if !path.is_empty() && path.bytes().all(|b| b.is_ascii_digit()) {
        return path
            .parse()
            .with_context(|| format!("frame count '{path}' out of range"));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to open frames file '{path}'"))?;
    let token = raw
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("frames file '{}' is empty", path))?;
    token
        .parse()
        .with_context(|| format!("frames file '{path}' does not start with an integer"))
}

/// Per-frame timestamps in seconds, in file order.
///
/// Values are separated by whitespace or commas; surrounding brackets are
/// tolerated. Reading stops at the first token that is not a number.
pub fn read_timestamps(path: &Path) -> Result<Vec<f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut timestamps = Vec::new();
    for token in raw
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|token| token.trim_matches(|c| c == '[' || c == ']'))
        .filter(|token| !token.is_empty())
    {
        match token.parse::<f64>() {
            Ok(value) => timestamps.push(value),
            Err(_) => {
                log::warn!(
                    "timestamps file {}: stopping at non-numeric token {:?}",
                    path.display(),
                    token
                );
                break;
            }
        }
    }
    Ok(timestamps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_composite_identifier() -> Result<()> {
        let specs = parse_identifier("cam0.mp4#RGB;cam0_d.mp4#Depth;300#Frames")?;
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].path, "cam0.mp4");
        assert_eq!(specs[0].role, SourceRole::Rgb);
        assert_eq!(specs[1].role, SourceRole::Depth);
        assert_eq!(specs[2].role, SourceRole::Frames);
        assert_eq!(specs[2].path, "300");
        assert!(specs.iter().all(|spec| spec.explicit_role));
        Ok(())
    }

    #[test]
    fn untagged_spec_defaults_to_rgb() -> Result<()> {
        let specs = parse_identifier("video.avi")?;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].role, SourceRole::Rgb);
        assert!(!specs[0].explicit_role);
        Ok(())
    }

    #[test]
    fn rejects_unknown_role_and_empty_paths() {
        assert!(parse_identifier("a.mp4#IR").is_err());
        assert!(parse_identifier("a.mp4#RGB#x").is_err());
        assert!(parse_identifier("a.mp4;;b.mp4").is_err());
        assert!(parse_identifier("#RGB").is_err());
        assert!(parse_identifier("  ").is_err());
    }

    #[test]
    fn timestamps_path_only_for_untagged_sources() -> Result<()> {
        let specs = parse_identifier("dir/seq.png;dir/other.png#RGB")?;
        assert_eq!(
            specs[0].timestamps_path(),
            Some(PathBuf::from("dir/seq_timestamps.txt"))
        );
        assert_eq!(specs[1].timestamps_path(), None);
        Ok(())
    }

    #[test]
    fn frame_limit_from_literal_or_file() -> Result<()> {
        assert_eq!(resolve_frame_limit("300")?, 300);

        let dir = TempDir::new()?;
        let path = dir.path().join("frames.txt");
        std::fs::write(&path, "42\n")?;
        assert_eq!(resolve_frame_limit(path.to_str().unwrap())?, 42);

        assert!(resolve_frame_limit("missing-frames.txt").is_err());
        Ok(())
    }

    #[test]
    fn reads_bracketed_timestamp_list() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("seq_timestamps.txt");
        std::fs::write(&path, "[0.0, 0.033, 0.066]\n")?;
        assert_eq!(read_timestamps(&path)?, vec![0.0, 0.033, 0.066]);

        std::fs::write(&path, "1.5\n2.5\nend\n3.5\n")?;
        assert_eq!(read_timestamps(&path)?, vec![1.5, 2.5]);
        Ok(())
    }
}
