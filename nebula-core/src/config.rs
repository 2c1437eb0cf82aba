//! Pipeline configuration surface.
//!
//! Every stage has its own serde-derived settings struct with defaults, so
//! a partial JSON document is a complete configuration:
//!
//! ```json
//! {
//!   "continuum": { "method": { "median": { "window": 31 } }, "wmasks": [{ "angstrom": [6555.0, 6570.0] }] },
//!   "psf": { "profile": "moffat", "r_fit": 3.0, "r_sub": 6.0, "auto_threshold": 10.0 },
//!   "smooth": { "adaptive": true, "target_snr": 5.0, "max_scale": 4 },
//!   "segment": { "snrmin": 3.0, "min_voxels": 5, "connectivity": "26" }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::continuum::ContinuumConfig;
use crate::error::ExtractError;
use crate::psf::{PhysicalPsfConfig, PsfConfig};
use crate::segment::SegmentConfig;
use crate::smooth::SmoothConfig;

/// Settings for a full extraction run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Continuum removal.
    pub continuum: ContinuumConfig,
    /// Point-source subtraction in voxel units; skipped when absent.
    pub psf: Option<PsfConfig>,
    /// Point-source subtraction in arcsec and Angstrom, converted through
    /// the cube header. Mutually exclusive with `psf`.
    pub psf_physical: Option<PhysicalPsfConfig>,
    /// Smoothing ahead of segmentation; skipped when absent.
    pub smooth: Option<SmoothConfig>,
    /// Segmentation.
    pub segment: SegmentConfig,
}

impl PipelineConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    /// [`ExtractError::Configuration`] for malformed JSON, unknown method
    /// names, or values that fail validation.
    pub fn from_json_str(json: &str) -> Result<Self, ExtractError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExtractError::Configuration(format!("invalid pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self, ExtractError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String, ExtractError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExtractError::Configuration(format!("cannot serialize config: {e}")))
    }

    /// Validate every configured stage.
    pub fn validate(&self) -> Result<(), ExtractError> {
        self.continuum.validate()?;
        if self.psf.is_some() && self.psf_physical.is_some() {
            return Err(ExtractError::Configuration(
                "give either psf or psf_physical, not both".to_string(),
            ));
        }
        if let Some(psf) = &self.psf {
            psf.validate()?;
        }
        if let Some(smooth) = &self.smooth {
            smooth.validate()?;
        }
        self.segment.validate()
    }
}
