//! Camera calibration profile and its interchange record.
//!
//! The on-disk record uses the field names shared with the calibration tools:
//! `cam_width`, `cam_height`, `cam_int`, `cam_dist`, `cam_fisheye` and an
//! optional `cam_RMS`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Intrinsics, distortion and resolution of one camera.
///
/// Owned by its device; `Device::calibration` hands out copies.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationProfile {
    /// Row-major 3x3 camera matrix.
    pub intrinsics: [[f64; 3]; 3],
    pub distortion: Vec<f64>,
    pub width: u32,
    pub height: u32,
    pub fisheye: bool,
    /// Reprojection error reported by the calibration that produced this profile.
    pub rms: Option<f64>,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            intrinsics: IDENTITY,
            distortion: Vec::new(),
            width: 0,
            height: 0,
            fisheye: false,
            rms: None,
        }
    }
}

const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

impl CalibrationProfile {
    /// Uncalibrated profile for a `width` x `height` source.
    pub fn uncalibrated(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn from_pinhole(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        distortion: Vec<f64>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            intrinsics: [[fx, 0.0, cx], [0.0, fy, cy], [0.0, 0.0, 1.0]],
            distortion,
            width,
            height,
            fisheye: false,
            rms: None,
        }
    }

    pub fn fx(&self) -> f64 {
        self.intrinsics[0][0]
    }

    pub fn fy(&self) -> f64 {
        self.intrinsics[1][1]
    }

    pub fn cx(&self) -> f64 {
        self.intrinsics[0][2]
    }

    pub fn cy(&self) -> f64 {
        self.intrinsics[1][2]
    }

    /// Same camera observed at another resolution.
    pub fn scaled_to(&self, width: u32, height: u32) -> Result<Self> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("cannot rescale a profile without a resolution"));
        }
        let sx = f64::from(width) / f64::from(self.width);
        let sy = f64::from(height) / f64::from(self.height);
        let mut scaled = self.clone();
        scaled.intrinsics[0][0] *= sx;
        scaled.intrinsics[0][1] *= sx;
        scaled.intrinsics[0][2] *= sx;
        scaled.intrinsics[1][1] *= sy;
        scaled.intrinsics[1][2] *= sy;
        scaled.width = width;
        scaled.height = height;
        Ok(scaled)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read calibration file {}", path.display()))?;
        let record: CalibrationRecord = serde_json::from_str(&raw)
            .with_context(|| format!("invalid calibration file {}", path.display()))?;
        let profile = Self::try_from(record)?;
        log::info!(
            "Calibration: loaded {} ({}x{}, fx={:.2}, fy={:.2})",
            path.display(),
            profile.width,
            profile.height,
            profile.fx(),
            profile.fy()
        );
        Ok(profile)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let record = CalibrationRecord::from(self);
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(path, json)
            .with_context(|| format!("write calibration file {}", path.display()))?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Interchange record
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationRecord {
    cam_width: u32,
    cam_height: u32,
    cam_int: MatrixField,
    #[serde(default)]
    cam_dist: Vec<f64>,
    #[serde(default)]
    cam_fisheye: bool,
    #[serde(rename = "cam_RMS", default, skip_serializing_if = "Option::is_none")]
    cam_rms: Option<f64>,
}

/// `cam_int` is written by some tools as nested rows and by others as a
/// matrix object with flat row-major data.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MatrixField {
    Rows([[f64; 3]; 3]),
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        type_id: Option<String>,
        rows: usize,
        cols: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dt: Option<String>,
        data: Vec<f64>,
    },
}

impl MatrixField {
    fn to_rows(&self) -> Result<[[f64; 3]; 3]> {
        match self {
            MatrixField::Rows(rows) => Ok(*rows),
            MatrixField::Object {
                rows, cols, data, ..
            } => {
                if *rows != 3 || *cols != 3 || data.len() != 9 {
                    return Err(anyhow!(
                        "cam_int must be a 3x3 matrix, got {}x{} with {} values",
                        rows,
                        cols,
                        data.len()
                    ));
                }
                let mut out = [[0.0; 3]; 3];
                for (i, value) in data.iter().enumerate() {
                    out[i / 3][i % 3] = *value;
                }
                Ok(out)
            }
        }
    }
}

impl TryFrom<CalibrationRecord> for CalibrationProfile {
    type Error = anyhow::Error;

    fn try_from(record: CalibrationRecord) -> Result<Self> {
        Ok(Self {
            intrinsics: record.cam_int.to_rows()?,
            distortion: record.cam_dist,
            width: record.cam_width,
            height: record.cam_height,
            fisheye: record.cam_fisheye,
            rms: record.cam_rms,
        })
    }
}

impl From<&CalibrationProfile> for CalibrationRecord {
    fn from(profile: &CalibrationProfile) -> Self {
        Self {
            cam_width: profile.width,
            cam_height: profile.height,
            cam_int: MatrixField::Object {
                type_id: Some("opencv-matrix".to_string()),
                rows: 3,
                cols: 3,
                dt: Some("d".to_string()),
                data: profile.intrinsics.iter().flatten().copied().collect(),
            },
            cam_dist: profile.distortion.clone(),
            cam_fisheye: profile.fisheye,
            cam_rms: profile.rms,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_matrix_object_record() -> Result<()> {
        let file = NamedTempFile::new()?;
        std::fs::write(
            file.path(),
            r#"{
                "cam_width": 1280,
                "cam_height": 720,
                "cam_int": {"type_id": "opencv-matrix", "rows": 3, "cols": 3, "dt": "d",
                            "data": [910.5, 0.0, 640.2, 0.0, 908.1, 360.7, 0.0, 0.0, 1.0]},
                "cam_dist": [0.1, -0.2, 0.0, 0.0, 0.05],
                "cam_RMS": 0.31,
                "cam_fisheye": false
            }"#,
        )?;

        let profile = CalibrationProfile::load(file.path())?;
        assert_eq!(profile.width, 1280);
        assert_eq!(profile.height, 720);
        assert_eq!(profile.fx(), 910.5);
        assert_eq!(profile.cy(), 360.7);
        assert_eq!(profile.distortion.len(), 5);
        assert_eq!(profile.rms, Some(0.31));
        Ok(())
    }

    #[test]
    fn loads_nested_rows_record() -> Result<()> {
        let file = NamedTempFile::new()?;
        std::fs::write(
            file.path(),
            r#"{"cam_width": 640, "cam_height": 480,
                "cam_int": [[500.0, 0.0, 320.0], [0.0, 501.0, 240.0], [0.0, 0.0, 1.0]],
                "cam_dist": [], "cam_fisheye": true}"#,
        )?;

        let profile = CalibrationProfile::load(file.path())?;
        assert!(profile.fisheye);
        assert_eq!(profile.fy(), 501.0);
        Ok(())
    }

    #[test]
    fn rejects_non_square_matrix() {
        let record = CalibrationRecord {
            cam_width: 1,
            cam_height: 1,
            cam_int: MatrixField::Object {
                type_id: None,
                rows: 2,
                cols: 3,
                dt: None,
                data: vec![0.0; 6],
            },
            cam_dist: vec![],
            cam_fisheye: false,
            cam_rms: None,
        };
        assert!(CalibrationProfile::try_from(record).is_err());
    }

    #[test]
    fn save_writes_interchange_field_names() -> Result<()> {
        let file = NamedTempFile::new()?;
        let profile =
            CalibrationProfile::from_pinhole(600.0, 600.0, 320.0, 240.0, vec![0.1], 640, 480);
        profile.save(file.path())?;

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(file.path())?)?;
        assert_eq!(raw["cam_width"], 640);
        assert_eq!(raw["cam_int"]["rows"], 3);
        assert_eq!(raw["cam_int"]["data"][2], 320.0);
        assert_eq!(CalibrationProfile::load(file.path())?, profile);
        Ok(())
    }

    #[test]
    fn scaling_halves_focal_length() -> Result<()> {
        let profile =
            CalibrationProfile::from_pinhole(600.0, 500.0, 320.0, 240.0, vec![], 640, 480);
        let half = profile.scaled_to(320, 240)?;
        assert_eq!(half.fx(), 300.0);
        assert_eq!(half.fy(), 250.0);
        assert_eq!(half.cx(), 160.0);
        assert_eq!(half.width, 320);
        Ok(())
    }
}
