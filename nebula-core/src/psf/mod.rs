//! Point-source modelling and subtraction.
//!
//! A point source is fitted on a white-light image with an analytic
//! profile (Gaussian or Moffat), optionally recentred, then scaled to each
//! wavelength layer and subtracted within the subtraction radius. Several
//! sources are folded sequentially: each one is fitted against the residual
//! of all earlier subtractions.
//!
//! For slicer IFUs a second, empirical method models each slice directly:
//! the white-light profile of the slice is scaled to the slice's profile in
//! every layer (see [`slice`]).
//!
//! # Module Organization
//!
//! - **profile**: analytic profiles, parameter vectors and optimizer bounds
//! - **fit**: bounded profile fitting with the recentering state machine
//! - **subtract**: single-source subtraction with variance propagation
//! - **detect**: automatic peak detection with non-maximum suppression
//! - **slice**: slice-by-slice empirical subtraction without a fitted profile
//! - **multi**: source selection and the sequential multi-source fold
//!
//! # Amplitude and variance model
//!
//! With `P` the fitted profile normalised to unit peak, the amplitude in a
//! layer is the linear least-squares estimate inside `r_fit`,
//! `A = sum(P * d) / sum(P^2)`, after removing the layer's local
//! background. The subtracted voxels receive the amplitude estimator's
//! variance on top of their own: `var_out = var_in + P^2 * var(A)` with
//! `var(A) = sum(P^2 * var) / sum(P^2)^2`.

pub mod detect;
pub mod fit;
pub mod multi;
pub mod profile;
pub mod slice;
pub mod subtract;

pub use detect::{detect_sources, Detection};
pub use fit::{fit_source, FitOutcome, FittedProfile, RecenterState};
pub use multi::{psf_sub_all, psf_sub_regions, SourceSelection};
pub use profile::{ProfileModel, ProfileShape};
pub use slice::SliceSourceModel;
pub use subtract::{psf_sub, PsfResult};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::header::CubeHeaderAdapter;
use crate::mask::RegionShape;

/// Point-source profile family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsfProfile {
    /// Circular Gaussian.
    #[default]
    Gaussian,
    /// Circular Moffat.
    Moffat,
}

impl FromStr for PsfProfile {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" | "gauss" => Ok(PsfProfile::Gaussian),
            "moffat" => Ok(PsfProfile::Moffat),
            _ => Err(ExtractError::Configuration(format!(
                "unknown PSF profile '{s}'. Valid options: gaussian, moffat"
            ))),
        }
    }
}

/// Spatial index that enumerates the slices of a slicer IFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceDirection {
    /// Each slice is one column (`x` fixed), its profile runs along `y`.
    #[default]
    Columns,
    /// Each slice is one row (`y` fixed), its profile runs along `x`.
    Rows,
}

/// Settings of the slice-by-slice method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceSettings {
    /// Slices on each side of the source's slice that are modelled.
    pub slice_radius: usize,
    /// Minimum white-light profile SNR (flux inside `r_fit` over the
    /// profile's standard deviation) for a slice to be modelled.
    pub min_snr: f64,
    /// Slice orientation.
    pub direction: SliceDirection,
}

impl Default for SliceSettings {
    fn default() -> Self {
        Self {
            slice_radius: 3,
            min_snr: 7.0,
            direction: SliceDirection::Columns,
        }
    }
}

/// How a point source is modelled.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsfMethod {
    /// Analytic 2D profile fitted on a white-light image.
    #[default]
    Profile,
    /// Empirical white-light profile per slice and layer.
    Slices(SliceSettings),
}

/// Point-source subtraction settings in voxel units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsfConfig {
    /// Modelling method.
    pub method: PsfMethod,
    /// Profile family.
    pub profile: PsfProfile,
    /// Fit radius in pixels.
    pub r_fit: f64,
    /// Subtraction radius in pixels, at least `r_fit`.
    pub r_sub: f64,
    /// Replace the nominal position by the fitted center and refit.
    pub recenter: bool,
    /// Cap on fit iterations when recentering.
    pub max_recenter_iterations: usize,
    /// Center shift (pixels) below which recentering has converged.
    pub recenter_tolerance: f64,
    /// Width of the white-light window in layers; 0 uses the whole cube.
    pub wl_window: usize,
    /// Center layer of the white-light window; defaults to the middle layer.
    pub wl_center: Option<usize>,
    /// Closed layer ranges excluded from white-light images.
    pub wmasks: Vec<(usize, usize)>,
    /// Explicit source positions `(x, y)`.
    pub positions: Option<Vec<(f64, f64)>>,
    /// Source regions; their centers are the source positions.
    pub regions: Option<Vec<RegionShape>>,
    /// Automatic detection SNR threshold.
    pub auto_threshold: Option<f64>,
    /// Base seed for the stochastic optimizer; source `i` uses `seed + i`.
    pub seed: u64,
}

impl Default for PsfConfig {
    fn default() -> Self {
        Self {
            method: PsfMethod::Profile,
            profile: PsfProfile::Gaussian,
            r_fit: 3.0,
            r_sub: 6.0,
            recenter: true,
            max_recenter_iterations: 5,
            recenter_tolerance: 0.01,
            wl_window: 0,
            wl_center: None,
            wmasks: Vec::new(),
            positions: None,
            regions: None,
            auto_threshold: None,
            seed: 0,
        }
    }
}

impl PsfConfig {
    /// Check radii and iteration settings.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if !(self.r_fit > 0.0 && self.r_fit.is_finite()) {
            return Err(ExtractError::Configuration(format!(
                "r_fit must be positive, got {}",
                self.r_fit
            )));
        }
        if !(self.r_sub >= self.r_fit && self.r_sub.is_finite()) {
            return Err(ExtractError::Configuration(format!(
                "r_sub ({}) must be at least r_fit ({})",
                self.r_sub, self.r_fit
            )));
        }
        if self.max_recenter_iterations == 0 {
            return Err(ExtractError::Configuration(
                "max_recenter_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.recenter_tolerance > 0.0) {
            return Err(ExtractError::Configuration(
                "recenter_tolerance must be positive".to_string(),
            ));
        }
        if let PsfMethod::Slices(settings) = &self.method {
            if !(settings.min_snr >= 0.0 && settings.min_snr.is_finite()) {
                return Err(ExtractError::Configuration(format!(
                    "slice min_snr must be finite and non-negative, got {}",
                    settings.min_snr
                )));
            }
        }
        if let Some(threshold) = self.auto_threshold {
            if !(threshold > 0.0 && threshold.is_finite()) {
                return Err(ExtractError::Configuration(format!(
                    "auto_threshold must be positive, got {threshold}"
                )));
            }
        }
        Ok(())
    }
}

/// Point-source settings in physical units, converted through a header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalPsfConfig {
    /// Modelling method.
    pub method: PsfMethod,
    /// Profile family.
    pub profile: PsfProfile,
    /// Fit radius in arcsec.
    pub r_fit: f64,
    /// Subtraction radius in arcsec.
    pub r_sub: f64,
    /// Replace the nominal position by the fitted center and refit.
    pub recenter: bool,
    /// Cap on fit iterations when recentering.
    pub max_recenter_iterations: usize,
    /// Convergence tolerance in pixels.
    pub recenter_tolerance: f64,
    /// White-light window width in Angstrom; 0 uses the whole cube.
    pub wl_window: f64,
    /// Center wavelength of the white-light window (Angstrom).
    pub wl_center: Option<f64>,
    /// Closed wavelength ranges (Angstrom) excluded from white-light images.
    pub wmasks: Vec<(f64, f64)>,
    /// Explicit source positions `(x, y)` in pixels.
    pub positions: Option<Vec<(f64, f64)>>,
    /// Source regions.
    pub regions: Option<Vec<RegionShape>>,
    /// Automatic detection SNR threshold.
    pub auto_threshold: Option<f64>,
    /// Base optimizer seed.
    pub seed: u64,
}

impl Default for PhysicalPsfConfig {
    fn default() -> Self {
        let voxel = PsfConfig::default();
        Self {
            method: voxel.method,
            profile: voxel.profile,
            r_fit: 1.5,
            r_sub: 5.0,
            recenter: voxel.recenter,
            max_recenter_iterations: voxel.max_recenter_iterations,
            recenter_tolerance: voxel.recenter_tolerance,
            wl_window: 0.0,
            wl_center: None,
            wmasks: Vec::new(),
            positions: None,
            regions: None,
            auto_threshold: None,
            seed: 0,
        }
    }
}

impl PhysicalPsfConfig {
    /// Convert radii, window and wavelength masks to voxel units.
    ///
    /// Region sizes given in arcsec stay in arcsec; they are only used for
    /// their centers here.
    pub fn to_voxel_units(&self, header: &dyn CubeHeaderAdapter) -> Result<PsfConfig, ExtractError> {
        let scale = header.pixel_scale_arcsec();
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(ExtractError::Configuration(format!(
                "pixel scale must be positive, got {scale}"
            )));
        }
        let axis = header.wavelength_axis();
        if axis.step == 0.0 {
            return Err(ExtractError::Configuration(
                "wavelength step must be non-zero".to_string(),
            ));
        }

        let wl_center = self.wl_center.map(|w| {
            axis.layer_of(w)
                .round()
                .clamp(0.0, axis.count.saturating_sub(1) as f64) as usize
        });

        let wmasks = axis.excluded_runs(&self.wmasks);

        let config = PsfConfig {
            method: self.method,
            profile: self.profile,
            r_fit: header.arcsec_to_pixels(self.r_fit),
            r_sub: header.arcsec_to_pixels(self.r_sub),
            recenter: self.recenter,
            max_recenter_iterations: self.max_recenter_iterations,
            recenter_tolerance: self.recenter_tolerance,
            wl_window: axis.width_in_layers(self.wl_window),
            wl_center,
            wmasks,
            positions: self.positions.clone(),
            regions: self.regions.clone(),
            auto_threshold: self.auto_threshold,
            seed: self.seed,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Fitted amplitude of one wavelength layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum LayerAmplitude {
    /// Least-squares amplitude (clamped at zero) and its variance, when a
    /// variance cube was supplied.
    Fitted {
        /// Peak amplitude of the unit profile in this layer.
        amplitude: f64,
        /// Variance of the amplitude estimate.
        variance: Option<f64>,
    },
    /// The fit aperture held no finite sample in this layer.
    NoModel,
}

impl LayerAmplitude {
    /// Amplitude, or `None` for layers without a model.
    pub fn value(&self) -> Option<f64> {
        match self {
            LayerAmplitude::Fitted { amplitude, .. } => Some(*amplitude),
            LayerAmplitude::NoModel => None,
        }
    }
}

/// Fitted point source, as subtracted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceModel {
    /// Position in subtraction order.
    pub index: usize,
    /// Position the fit started from.
    pub nominal: (f64, f64),
    /// White-light profile fit (center and shape used for subtraction).
    pub profile: ProfileModel,
    /// Per-layer amplitudes of the unit-peak profile.
    pub amplitudes: Vec<LayerAmplitude>,
    /// Fit iterations executed (1 without recentering).
    pub recenter_iterations: usize,
    /// Whether recentering met its tolerance.
    pub converged: bool,
    /// Residual sum of squares of the final white-light fit.
    pub cost: f64,
}

impl SourceModel {
    /// Fitted center `(x, y)`.
    pub fn center(&self) -> (f64, f64) {
        self.profile.center
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{LinearHeader, WavelengthAxis};
    use approx::assert_relative_eq;

    #[test]
    fn test_profile_names() {
        assert_eq!("Moffat".parse::<PsfProfile>().unwrap(), PsfProfile::Moffat);
        assert!(matches!(
            "airy".parse::<PsfProfile>(),
            Err(ExtractError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_radii() {
        let config = PsfConfig {
            r_fit: 4.0,
            r_sub: 3.0,
            ..PsfConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ExtractError::Configuration(_))
        ));
        assert!(PsfConfig::default().validate().is_ok());
    }

    #[test]
    fn test_physical_conversion() {
        let header = LinearHeader {
            wavelength: WavelengthAxis {
                start: 4000.0,
                step: 1.0,
                count: 100,
            },
            pixel_scale: 0.5,
        };
        let physical = PhysicalPsfConfig {
            r_fit: 1.5,
            r_sub: 3.0,
            wl_window: 40.0,
            wl_center: Some(4050.0),
            wmasks: vec![(4010.0, 4012.0), (4098.0, 4200.0)],
            ..PhysicalPsfConfig::default()
        };

        let config = physical.to_voxel_units(&header).unwrap();
        assert_relative_eq!(config.r_fit, 3.0);
        assert_relative_eq!(config.r_sub, 6.0);
        assert_eq!(config.wl_window, 40);
        assert_eq!(config.wl_center, Some(50));
        assert_eq!(config.wmasks, vec![(10, 12), (98, 99)]);
    }

    #[test]
    fn test_method_json() {
        let config: PsfConfig =
            serde_json::from_str(r#"{"method":{"slices":{"slice_radius":2,"direction":"rows"}}}"#)
                .unwrap();
        let PsfMethod::Slices(settings) = config.method else {
            panic!("expected the slice method");
        };
        assert_eq!(settings.slice_radius, 2);
        assert_eq!(settings.min_snr, 7.0);
        assert_eq!(settings.direction, SliceDirection::Rows);

        let config: PsfConfig = serde_json::from_str(r#"{"method":"profile"}"#).unwrap();
        assert_eq!(config.method, PsfMethod::Profile);

        let bad = PsfConfig {
            method: PsfMethod::Slices(SliceSettings {
                min_snr: f64::NAN,
                ..SliceSettings::default()
            }),
            ..PsfConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ExtractError::Configuration(_))));
    }
}
