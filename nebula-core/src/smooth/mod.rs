//! Smoothing of data and variance cubes.
//!
//! Fixed-scale smoothing convolves along a chosen subset of axes with a
//! separable box or Gaussian kernel. Variance is propagated with the exact
//! linear-filter law: every output variance is the sum over kernel taps of
//! the squared tap weight times the input variance.
//!
//! Adaptive smoothing (see [`adaptive`]) grows a box kernel per voxel until
//! a target SNR is reached.

pub mod adaptive;

pub use adaptive::{smooth_adaptive, AdaptiveResult};

use std::str::FromStr;

use ndarray::{Array, ArrayView, ArrayView1, ArrayViewMut1, Axis, Dimension, Zip};
use serde::{Deserialize, Serialize};

use crate::cube::{check_shape, DataCube};
use crate::error::{Diagnostic, Diagnostics, ExtractError};

/// Smoothing kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelType {
    /// Uniform weights over `2 * round((scale - 1) / 2) + 1` taps.
    #[default]
    Box,
    /// Gaussian with sigma equal to the scale, truncated at 4 sigma.
    Gaussian,
}

impl FromStr for KernelType {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "box" => Ok(KernelType::Box),
            "gaussian" => Ok(KernelType::Gaussian),
            _ => Err(ExtractError::Configuration(format!(
                "unknown kernel type '{s}'. Valid options: box, gaussian"
            ))),
        }
    }
}

/// Treatment of taps falling outside the array (or on non-finite voxels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    /// Drop missing taps and renormalise the remaining weights.
    #[default]
    Truncate,
    /// Missing taps contribute zero; weights are not renormalised.
    Zero,
}

/// Normalised symmetric 1D kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    weights: Vec<f64>,
}

impl Kernel {
    /// Build the kernel of the given family and scale (in voxels).
    ///
    /// # Errors
    /// [`ExtractError::Configuration`] for a non-positive or non-finite scale.
    pub fn new(kind: KernelType, scale: f64) -> Result<Self, ExtractError> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(ExtractError::Configuration(format!(
                "smoothing scale must be positive, got {scale}"
            )));
        }

        let weights = match kind {
            KernelType::Box => {
                let half = ((scale - 1.0) / 2.0).round().max(0.0) as usize;
                let n = 2 * half + 1;
                vec![1.0 / n as f64; n]
            }
            KernelType::Gaussian => {
                let half = (4.0 * scale).ceil() as isize;
                let raw: Vec<f64> = (-half..=half)
                    .map(|i| (-(i * i) as f64 / (2.0 * scale * scale)).exp())
                    .collect();
                let total: f64 = raw.iter().sum();
                raw.into_iter().map(|w| w / total).collect()
            }
        };
        Ok(Self { weights })
    }

    /// Number of taps (always odd).
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Tap weights, summing to one.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn half(&self) -> usize {
        self.weights.len() / 2
    }
}

/// Smoothed data with its propagated variance.
#[derive(Debug, Clone, PartialEq)]
pub struct Smoothed<D: Dimension> {
    /// Smoothed values.
    pub data: Array<f64, D>,
    /// Propagated variance, when an input variance was given.
    pub variance: Option<Array<f64, D>>,
}

/// Convolve one lane, returning `(value, variance)` sums per output index.
fn convolve_lane(
    data: &ArrayView1<f64>,
    variance: Option<&ArrayView1<f64>>,
    kernel: &Kernel,
    edge: EdgeMode,
    mut out: ArrayViewMut1<f64>,
    mut out_var: Option<ArrayViewMut1<f64>>,
) {
    let n = data.len() as isize;
    let half = kernel.half() as isize;

    for i in 0..n {
        let mut sum = 0.0;
        let mut weight = 0.0;
        let mut var_sum = 0.0;

        for (k, &w) in kernel.weights().iter().enumerate() {
            let j = i + k as isize - half;
            if j < 0 || j >= n {
                continue;
            }
            let v = data[j as usize];
            if !v.is_finite() {
                continue;
            }
            sum += w * v;
            weight += w;
            if let Some(var) = variance {
                var_sum += w * w * var[j as usize];
            }
        }

        let (value, var_value) = match edge {
            EdgeMode::Zero => (sum, var_sum),
            EdgeMode::Truncate if weight > 0.0 => (sum / weight, var_sum / (weight * weight)),
            EdgeMode::Truncate => (f64::NAN, f64::NAN),
        };

        out[i as usize] = value;
        if let Some(ov) = out_var.as_mut() {
            ov[i as usize] = var_value;
        }
    }
}

/// Convolve data (and variance) along a subset of axes.
///
/// # Arguments
/// * `data` - Input array of any dimensionality
/// * `scale` - Kernel scale in voxels (box width or Gaussian sigma)
/// * `axes` - Axes to smooth along, each at most once
/// * `kind` - Kernel family
/// * `variance` - Optional variance, same shape as `data`
/// * `edge` - Edge handling
///
/// # Returns
/// Smoothed data and, when `variance` is given, its propagated variance.
/// The kernel is separable, so the passes along each axis commute.
pub fn smooth_nd<D: Dimension>(
    data: &ArrayView<f64, D>,
    scale: f64,
    axes: &[usize],
    kind: KernelType,
    variance: Option<&ArrayView<f64, D>>,
    edge: EdgeMode,
) -> Result<Smoothed<D>, ExtractError> {
    let kernel = Kernel::new(kind, scale)?;
    if let Some(var) = variance {
        check_shape("variance", data.shape(), var.shape())?;
    }
    for (i, &axis) in axes.iter().enumerate() {
        if axis >= data.ndim() || axes[..i].contains(&axis) {
            return Err(ExtractError::Configuration(format!(
                "invalid smoothing axes {axes:?} for a {}-dimensional array",
                data.ndim()
            )));
        }
    }

    log::debug!(
        "Smoothing {:?} along axes {:?} with {:?} kernel ({} taps)",
        data.shape(),
        axes,
        kind,
        kernel.len()
    );

    let mut current = data.to_owned();
    let mut current_var = variance.map(|v| v.to_owned());

    for &axis in axes {
        let mut next = Array::zeros(current.raw_dim());
        let next_var = match current_var.as_ref() {
            Some(var) => {
                let mut next_var = Array::zeros(current.raw_dim());
                Zip::from(next.lanes_mut(Axis(axis)))
                    .and(next_var.lanes_mut(Axis(axis)))
                    .and(current.lanes(Axis(axis)))
                    .and(var.lanes(Axis(axis)))
                    .par_for_each(|out, out_var, lane, var_lane| {
                        convolve_lane(&lane, Some(&var_lane), &kernel, edge, out, Some(out_var));
                    });
                Some(next_var)
            }
            None => {
                Zip::from(next.lanes_mut(Axis(axis)))
                    .and(current.lanes(Axis(axis)))
                    .par_for_each(|out, lane| {
                        convolve_lane(&lane, None, &kernel, edge, out, None);
                    });
                None
            }
        };
        current = next;
        current_var = next_var;
    }

    Ok(Smoothed {
        data: current,
        variance: current_var,
    })
}

/// Smooth every wavelength layer spatially (axes y and x).
pub fn smooth_cube_spatial(
    cube: &DataCube,
    scale: f64,
    kind: KernelType,
    edge: EdgeMode,
) -> Result<DataCube, ExtractError> {
    smooth_cube_axes(cube, scale, &[1, 2], kind, edge)
}

/// Smooth every spectrum along wavelength.
pub fn smooth_cube_wavelength(
    cube: &DataCube,
    scale: f64,
    kind: KernelType,
    edge: EdgeMode,
) -> Result<DataCube, ExtractError> {
    smooth_cube_axes(cube, scale, &[0], kind, edge)
}

fn smooth_cube_axes(
    cube: &DataCube,
    scale: f64,
    axes: &[usize],
    kind: KernelType,
    edge: EdgeMode,
) -> Result<DataCube, ExtractError> {
    let variance = cube.variance.as_ref().map(|v| v.view());
    let smoothed = smooth_nd(&cube.data.view(), scale, axes, kind, variance.as_ref(), edge)?;
    Ok(DataCube {
        data: smoothed.data,
        variance: smoothed.variance,
    })
}

/// Smoothing stage settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothConfig {
    /// Kernel family; adaptive smoothing only supports box kernels.
    pub kernel: KernelType,
    /// Fixed kernel scale in voxels.
    pub scale: f64,
    /// Smooth along the spatial axes.
    pub spatial: bool,
    /// Smooth along wavelength.
    pub spectral: bool,
    /// Edge handling for fixed-scale smoothing.
    pub edge: EdgeMode,
    /// Grow the kernel per voxel instead of using `scale`.
    pub adaptive: bool,
    /// SNR at which adaptive growth stops.
    pub target_snr: f64,
    /// Smallest adaptive half-width in voxels.
    pub min_scale: usize,
    /// Largest adaptive half-width in voxels.
    pub max_scale: usize,
}

impl Default for SmoothConfig {
    fn default() -> Self {
        Self {
            kernel: KernelType::Box,
            scale: 3.0,
            spatial: true,
            spectral: false,
            edge: EdgeMode::Truncate,
            adaptive: false,
            target_snr: 5.0,
            min_scale: 0,
            max_scale: 5,
        }
    }
}

impl SmoothConfig {
    /// Check scales, axes and the adaptive kernel restriction.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if !self.spatial && !self.spectral {
            return Err(ExtractError::Configuration(
                "smoothing needs at least one of spatial or spectral".to_string(),
            ));
        }
        if self.adaptive {
            if self.kernel != KernelType::Box {
                return Err(ExtractError::Configuration(
                    "adaptive smoothing supports box kernels only".to_string(),
                ));
            }
            if !(self.target_snr > 0.0 && self.target_snr.is_finite()) {
                return Err(ExtractError::Configuration(format!(
                    "target_snr must be positive, got {}",
                    self.target_snr
                )));
            }
            if self.max_scale < self.min_scale {
                return Err(ExtractError::Configuration(format!(
                    "max_scale ({}) is below min_scale ({})",
                    self.max_scale, self.min_scale
                )));
            }
        } else if !(self.scale > 0.0 && self.scale.is_finite()) {
            return Err(ExtractError::Configuration(format!(
                "smoothing scale must be positive, got {}",
                self.scale
            )));
        }
        Ok(())
    }

    fn axes(&self) -> Vec<usize> {
        let mut axes = Vec::new();
        if self.spectral {
            axes.push(0);
        }
        if self.spatial {
            axes.extend([1, 2]);
        }
        axes
    }
}

/// Output of [`smooth_cube`].
#[derive(Debug, Clone)]
pub struct SmoothResult {
    /// Smoothed data and variance.
    pub cube: DataCube,
    /// Adaptive half-width per voxel (adaptive mode only).
    pub scale_map: Option<ndarray::Array3<usize>>,
    /// Voxels that never reached the target SNR (adaptive mode only).
    pub low_confidence: Option<ndarray::Array3<bool>>,
    /// Low-confidence summary.
    pub diagnostics: Diagnostics,
}

/// Run the configured smoothing on a cube.
pub fn smooth_cube(cube: &DataCube, config: &SmoothConfig) -> Result<SmoothResult, ExtractError> {
    config.validate()?;

    if config.adaptive {
        let result = smooth_adaptive(cube, config)?;
        let mut diagnostics = Diagnostics::new();
        let flagged = result.low_confidence.iter().filter(|&&f| f).count();
        if flagged > 0 {
            diagnostics.push(Diagnostic::LowConfidence { voxels: flagged });
        }
        return Ok(SmoothResult {
            cube: DataCube {
                data: result.data,
                variance: Some(result.variance),
            },
            scale_map: Some(result.scale),
            low_confidence: Some(result.low_confidence),
            diagnostics,
        });
    }

    let smoothed = smooth_cube_axes(cube, config.scale, &config.axes(), config.kernel, config.edge)?;
    Ok(SmoothResult {
        cube: smoothed,
        scale_map: None,
        low_confidence: None,
        diagnostics: Diagnostics::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::{Array1, Array3};

    #[test]
    fn test_box_kernel_sizes() {
        assert_eq!(Kernel::new(KernelType::Box, 1.0).unwrap().len(), 1);
        assert_eq!(Kernel::new(KernelType::Box, 3.0).unwrap().len(), 3);
        assert_eq!(Kernel::new(KernelType::Box, 5.0).unwrap().len(), 5);
        assert_eq!(Kernel::new(KernelType::Box, 4.0).unwrap().len(), 5);
    }

    #[test]
    fn test_gaussian_kernel_normalised() {
        let kernel = Kernel::new(KernelType::Gaussian, 1.5).unwrap();
        assert_eq!(kernel.len(), 2 * 6 + 1);
        assert_relative_eq!(kernel.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(Kernel::new(KernelType::Gaussian, 0.0).is_err());
    }

    #[test]
    fn test_box_variance_is_v_over_n_in_interior() {
        let data = Array3::from_elem((4, 5, 20), 1.0);
        let var = Array3::from_elem((4, 5, 20), 2.0);

        for n in [3usize, 5, 7] {
            let out = smooth_nd(
                &data.view(),
                n as f64,
                &[2],
                KernelType::Box,
                Some(&var.view()),
                EdgeMode::Truncate,
            )
            .unwrap();
            let out_var = out.variance.unwrap();
            let half = n / 2;
            for x in half..20 - half {
                assert_relative_eq!(out_var[[1, 2, x]], 2.0 / n as f64, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_separable_variance_over_two_axes() {
        let data = Array3::from_elem((3, 9, 9), 0.0);
        let var = Array3::from_elem((3, 9, 9), 1.0);
        let out = smooth_nd(
            &data.view(),
            3.0,
            &[1, 2],
            KernelType::Box,
            Some(&var.view()),
            EdgeMode::Truncate,
        )
        .unwrap();
        assert_relative_eq!(out.variance.unwrap()[[1, 4, 4]], 1.0 / 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_truncate_preserves_constant_at_edges() {
        let data = Array3::from_elem((2, 6, 6), 4.0);
        let out = smooth_nd(
            &data.view(),
            1.0,
            &[1, 2],
            KernelType::Gaussian,
            None,
            EdgeMode::Truncate,
        )
        .unwrap();
        for &v in out.data.iter() {
            assert_relative_eq!(v, 4.0, epsilon = 1e-12);
        }
        assert!(out.variance.is_none());
    }

    #[test]
    fn test_zero_edge_darkens_borders() {
        let data = Array1::from_elem(5, 3.0);
        let out = smooth_nd(&data.view(), 3.0, &[0], KernelType::Box, None, EdgeMode::Zero).unwrap();
        assert_relative_eq!(out.data[0], 2.0);
        assert_relative_eq!(out.data[2], 3.0);
    }

    #[test]
    fn test_flux_spread_matches_kernel() {
        let mut data = Array1::zeros(9);
        data[4] = 9.0;
        let out = smooth_nd(&data.view(), 3.0, &[0], KernelType::Box, None, EdgeMode::Truncate).unwrap();
        assert_abs_diff_eq!(out.data[3], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.data[5], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.data[6], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_axes() {
        let data = Array3::<f64>::zeros((2, 2, 2));
        assert!(smooth_nd(&data.view(), 3.0, &[3], KernelType::Box, None, EdgeMode::Zero).is_err());
        assert!(smooth_nd(&data.view(), 3.0, &[1, 1], KernelType::Box, None, EdgeMode::Zero).is_err());
    }

    #[test]
    fn test_cube_helpers_fix_axes() {
        let mut data = Array3::zeros((5, 5, 5));
        data[[2, 2, 2]] = 1.0;
        let cube = DataCube::without_variance(data);

        let spatial = smooth_cube_spatial(&cube, 3.0, KernelType::Box, EdgeMode::Truncate).unwrap();
        assert_relative_eq!(spatial.data[[2, 1, 1]], 1.0 / 9.0, epsilon = 1e-12);
        assert_eq!(spatial.data[[1, 2, 2]], 0.0);

        let spectral = smooth_cube_wavelength(&cube, 3.0, KernelType::Box, EdgeMode::Truncate).unwrap();
        assert_relative_eq!(spectral.data[[1, 2, 2]], 1.0 / 3.0, epsilon = 1e-12);
        assert_eq!(spectral.data[[2, 1, 2]], 0.0);
    }

    #[test]
    fn test_adaptive_requires_box() {
        let config = SmoothConfig {
            adaptive: true,
            kernel: KernelType::Gaussian,
            ..SmoothConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ExtractError::Configuration(_))
        ));
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!("Gaussian".parse::<KernelType>().unwrap(), KernelType::Gaussian);
        assert!("tophat".parse::<KernelType>().is_err());
    }
}
