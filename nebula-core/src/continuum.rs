//! Continuum and background removal.
//!
//! A background model is fitted independently to each 1D spectrum (per
//! spaxel, along wavelength) or to each 2D wavelength layer, using only
//! unmasked finite samples, then evaluated over the full slice and
//! subtracted. The model cube is returned next to the subtracted cube so
//! that `subtracted + model` reproduces the input wherever it is finite.
//!
//! Subtracting a fitted model adds the model's own uncertainty to every
//! voxel. Polynomial models propagate the sample variances through the
//! least-squares covariance; median models use the large-sample variance
//! of a median, `(π/2) Σσ² / n²`, over the samples they were taken from.
//! Without an input variance cube there is nothing to propagate.
//!
//! Wavelength ranges listed in [`ContinuumConfig::wmasks`] (emission lines,
//! typically) are left out of every spectral fit.

use std::str::FromStr;
use std::time::Instant;

use ndarray::{
    s, Array, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Dimension, Ix1, Ix2, Zip,
};
use nebula_math::polyfit::surface_coefficient_count;
use nebula_math::{
    clipped_median, median, median_variance, polyfit, polyfit2d, polyfit2d_with_variance,
    polyfit_with_variance,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cube::DataCube;
use crate::error::{Diagnostic, Diagnostics, ExtractError};
use crate::header::CubeHeaderAdapter;
use crate::mask::{combine_masks, VoxelMask};

/// Highest polynomial order accepted by configuration validation.
pub const MAX_POLYNOMIAL_ORDER: usize = 10;

/// Background model family with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMethod {
    /// Least-squares polynomial of order `order` (a 2D surface of total
    /// degree `order` for spatial slices).
    Polynomial {
        /// Polynomial order.
        order: usize,
    },
    /// Running median of `window` samples along spectra; a clipped median
    /// level for spatial slices.
    Median {
        /// Window length in layers (spectral slices only).
        window: usize,
    },
    /// Identity transform: the model is zero everywhere.
    None,
}

impl Default for BackgroundMethod {
    fn default() -> Self {
        BackgroundMethod::Polynomial { order: 1 }
    }
}

impl FromStr for BackgroundMethod {
    type Err = ExtractError;

    /// Parse a method name with its default parameters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polynomial" | "polyfit" => Ok(BackgroundMethod::Polynomial { order: 1 }),
            "median" => Ok(BackgroundMethod::Median { window: 31 }),
            "none" => Ok(BackgroundMethod::None),
            _ => Err(ExtractError::Configuration(format!(
                "unknown background method '{s}'. Valid options: polynomial, median, none"
            ))),
        }
    }
}

/// Orientation of the independent slices a background is fitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceAxis {
    /// One spectrum per spaxel, along wavelength.
    #[default]
    Spectral,
    /// One plane per wavelength layer.
    Spatial,
}

/// A closed wavelength range excluded from continuum fits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WavelengthMask {
    /// Layer indices `first..=last`.
    Layers(usize, usize),
    /// Wavelengths in Angstrom; resolved through a cube header.
    Angstrom(f64, f64),
}

/// Continuum subtraction settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuumConfig {
    /// Model family and parameters.
    pub method: BackgroundMethod,
    /// Slice orientation.
    pub axis: SliceAxis,
    /// Wavelength ranges left out of spectral fits. The model is still
    /// evaluated and subtracted there.
    pub wmasks: Vec<WavelengthMask>,
}

impl ContinuumConfig {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if !self.wmasks.is_empty() && self.axis == SliceAxis::Spatial {
            return Err(ExtractError::Configuration(
                "wavelength masks apply to spectral continuum fits only".to_string(),
            ));
        }
        for mask in &self.wmasks {
            if let WavelengthMask::Angstrom(a, b) = *mask {
                if !a.is_finite() || !b.is_finite() {
                    return Err(ExtractError::Configuration(format!(
                        "wavelength mask ({a}, {b}) is not finite"
                    )));
                }
            }
        }
        match self.method {
            BackgroundMethod::Polynomial { order } if order > MAX_POLYNOMIAL_ORDER => {
                Err(ExtractError::Configuration(format!(
                    "polynomial order {order} exceeds {MAX_POLYNOMIAL_ORDER}"
                )))
            }
            BackgroundMethod::Median { window: 0 } => Err(ExtractError::Configuration(
                "median window must be at least 1".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Copy with every Angstrom range replaced by the layers it covers.
    pub fn to_layer_units(&self, header: &dyn CubeHeaderAdapter) -> ContinuumConfig {
        let axis = header.wavelength_axis();
        let wmasks = self
            .wmasks
            .iter()
            .flat_map(|mask| match *mask {
                WavelengthMask::Layers(first, last) => vec![WavelengthMask::Layers(first, last)],
                WavelengthMask::Angstrom(a, b) => axis
                    .excluded_runs(&[(a, b)])
                    .into_iter()
                    .map(|(first, last)| WavelengthMask::Layers(first, last))
                    .collect(),
            })
            .collect();
        ContinuumConfig {
            wmasks,
            ..self.clone()
        }
    }

    /// Per-layer exclusion flags for a cube of `nz` layers.
    fn excluded_layers(&self, nz: usize) -> Result<Array1<bool>, ExtractError> {
        let mut excluded = Array1::from_elem(nz, false);
        for mask in &self.wmasks {
            match *mask {
                WavelengthMask::Layers(a, b) => {
                    let (first, last) = (a.min(b), a.max(b));
                    for z in first..=last.min(nz.saturating_sub(1)) {
                        excluded[z] = true;
                    }
                }
                WavelengthMask::Angstrom(a, b) => {
                    return Err(ExtractError::Configuration(format!(
                        "wavelength mask ({a}, {b}) Angstrom needs a cube header; \
                         convert it with ContinuumConfig::to_layer_units"
                    )))
                }
            }
        }
        Ok(excluded)
    }
}

/// Output of [`subtract_continuum`].
#[derive(Debug, Clone)]
pub struct ContinuumResult {
    /// Background-subtracted cube; its variance includes the model's.
    pub subtracted: DataCube,
    /// Background model evaluated on every voxel.
    pub model: Array3<f64>,
    /// Variance of the model, when the input carried variance.
    pub model_variance: Option<Array3<f64>>,
    /// Slices left unmodelled.
    pub diagnostics: Diagnostics,
}

/// A slice model with its variance, when sample variances were given.
struct Fitted<D: Dimension> {
    model: Array<f64, D>,
    variance: Option<Array<f64, D>>,
}

/// One background model family fitted to isolated slices.
///
/// `None` from a fit means the slice has fewer usable samples than
/// [`ContinuumModel::required_samples`].
trait ContinuumModel: Sync {
    /// Minimum usable samples for a slice of the given orientation.
    fn required_samples(&self, axis: SliceAxis) -> usize;

    /// Model of one spectrum.
    fn model_spectrum(
        &self,
        values: &ArrayView1<f64>,
        variance: Option<&ArrayView1<f64>>,
        usable: &ArrayView1<bool>,
    ) -> Option<Fitted<Ix1>>;

    /// Model of one wavelength layer.
    fn model_layer(
        &self,
        values: &ArrayView2<f64>,
        variance: Option<&ArrayView2<f64>>,
        usable: &ArrayView2<bool>,
    ) -> Option<Fitted<Ix2>>;
}

struct PolynomialModel {
    order: usize,
}

impl ContinuumModel for PolynomialModel {
    fn required_samples(&self, axis: SliceAxis) -> usize {
        match axis {
            SliceAxis::Spectral => self.order + 1,
            SliceAxis::Spatial => surface_coefficient_count(self.order),
        }
    }

    fn model_spectrum(
        &self,
        values: &ArrayView1<f64>,
        variance: Option<&ArrayView1<f64>>,
        usable: &ArrayView1<bool>,
    ) -> Option<Fitted<Ix1>> {
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut var = Vec::new();
        for (i, (&v, &ok)) in values.iter().zip(usable.iter()).enumerate() {
            if ok {
                x.push(i as f64);
                y.push(v);
                var.push(variance.map_or(0.0, |w| w[i]));
            }
        }

        let poly = match variance {
            Some(_) => polyfit_with_variance(&x, &y, &var, self.order),
            None => polyfit(&x, &y, self.order),
        }
        .ok()?;
        let n = values.len();
        Some(Fitted {
            model: Array1::from_shape_fn(n, |i| poly.eval(i as f64)),
            variance: variance.map(|_| {
                Array1::from_shape_fn(n, |i| poly.eval_variance(i as f64).unwrap_or(0.0))
            }),
        })
    }

    fn model_layer(
        &self,
        values: &ArrayView2<f64>,
        variance: Option<&ArrayView2<f64>>,
        usable: &ArrayView2<bool>,
    ) -> Option<Fitted<Ix2>> {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut zs = Vec::new();
        let mut var = Vec::new();
        for (((y, x), &v), &ok) in values.indexed_iter().zip(usable.iter()) {
            if ok {
                xs.push(x as f64);
                ys.push(y as f64);
                zs.push(v);
                var.push(variance.map_or(0.0, |w| w[[y, x]]));
            }
        }

        let surface = match variance {
            Some(_) => polyfit2d_with_variance(&xs, &ys, &zs, &var, self.order),
            None => polyfit2d(&xs, &ys, &zs, self.order),
        }
        .ok()?;
        Some(Fitted {
            model: Array2::from_shape_fn(values.dim(), |(y, x)| surface.eval(x as f64, y as f64)),
            variance: variance.map(|_| {
                Array2::from_shape_fn(values.dim(), |(y, x)| {
                    surface.eval_variance(x as f64, y as f64).unwrap_or(0.0)
                })
            }),
        })
    }
}

struct MedianModel {
    window: usize,
}

impl ContinuumModel for MedianModel {
    fn required_samples(&self, _axis: SliceAxis) -> usize {
        1
    }

    fn model_spectrum(
        &self,
        values: &ArrayView1<f64>,
        variance: Option<&ArrayView1<f64>>,
        usable: &ArrayView1<bool>,
    ) -> Option<Fitted<Ix1>> {
        let n = values.len();
        let half = self.window / 2;

        // Running median where the window holds usable samples.
        let evaluated: Vec<(Option<f64>, Option<f64>)> = (0..n)
            .map(|i| {
                let lo = i.saturating_sub(half);
                let hi = (i + half + 1).min(n);
                let window: Vec<usize> = (lo..hi).filter(|&j| usable[j]).collect();
                let samples: Vec<f64> = window.iter().map(|&j| values[j]).collect();
                let spread = variance.and_then(|w| {
                    let var: Vec<f64> = window.iter().map(|&j| w[j]).collect();
                    median_variance(&var).ok()
                });
                (median(&samples).ok(), spread)
            })
            .collect();

        let (levels, spreads): (Vec<Option<f64>>, Vec<Option<f64>>) =
            evaluated.into_iter().unzip();
        Some(Fitted {
            model: fill_gaps(&levels)?,
            variance: variance.and_then(|_| fill_gaps(&spreads)),
        })
    }

    fn model_layer(
        &self,
        values: &ArrayView2<f64>,
        variance: Option<&ArrayView2<f64>>,
        usable: &ArrayView2<bool>,
    ) -> Option<Fitted<Ix2>> {
        let samples: Vec<f64> = values
            .iter()
            .zip(usable.iter())
            .filter(|(_, &ok)| ok)
            .map(|(&v, _)| v)
            .collect();
        let level = clipped_median(&samples).ok()?;

        // Clipping is ignored: every usable sample counts towards n.
        let spread = variance.map(|w| {
            let var: Vec<f64> = w
                .iter()
                .zip(usable.iter())
                .filter(|(_, &ok)| ok)
                .map(|(&v, _)| v)
                .collect();
            median_variance(&var).unwrap_or(0.0)
        });
        Some(Fitted {
            model: Array2::from_elem(values.dim(), level),
            variance: spread.map(|v| Array2::from_elem(values.dim(), v)),
        })
    }
}

/// Linear interpolation across missing positions, constant extrapolation
/// at the ends. `None` when no position was evaluated.
fn fill_gaps(evaluated: &[Option<f64>]) -> Option<Array1<f64>> {
    let known: Vec<(usize, f64)> = evaluated
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    let (&(first_i, first_v), &(last_i, last_v)) = (known.first()?, known.last()?);

    let mut out = Array1::zeros(evaluated.len());
    let mut next = 0;
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = if i <= first_i {
            first_v
        } else if i >= last_i {
            last_v
        } else {
            while known[next + 1].0 < i {
                next += 1;
            }
            let (i0, v0) = known[next];
            let (i1, v1) = known[next + 1];
            if i == i0 {
                v0
            } else {
                v0 + (v1 - v0) * (i - i0) as f64 / (i1 - i0) as f64
            }
        };
    }
    Some(out)
}

struct ZeroModel;

impl ContinuumModel for ZeroModel {
    fn required_samples(&self, _axis: SliceAxis) -> usize {
        0
    }

    fn model_spectrum(
        &self,
        values: &ArrayView1<f64>,
        _: Option<&ArrayView1<f64>>,
        _: &ArrayView1<bool>,
    ) -> Option<Fitted<Ix1>> {
        Some(Fitted {
            model: Array1::zeros(values.len()),
            variance: None,
        })
    }

    fn model_layer(
        &self,
        values: &ArrayView2<f64>,
        _: Option<&ArrayView2<f64>>,
        _: &ArrayView2<bool>,
    ) -> Option<Fitted<Ix2>> {
        Some(Fitted {
            model: Array2::zeros(values.dim()),
            variance: None,
        })
    }
}

impl BackgroundMethod {
    fn strategy(&self) -> Box<dyn ContinuumModel> {
        match *self {
            BackgroundMethod::Polynomial { order } => Box::new(PolynomialModel { order }),
            BackgroundMethod::Median { window } => Box::new(MedianModel { window }),
            BackgroundMethod::None => Box::new(ZeroModel),
        }
    }
}

/// Fit and subtract a background model slice by slice.
///
/// # Arguments
/// * `cube` - Input data and optional variance
/// * `config` - Model family, slice orientation and excluded wavelength
///   ranges (layer units; see [`ContinuumConfig::to_layer_units`])
/// * `exclude` - Voxels left out of every fit (true = excluded), e.g. known
///   sources; the model is still evaluated and subtracted there
///
/// # Returns
/// The subtracted cube with the model variance added, the model cube and
/// one [`Diagnostic::InsufficientData`] per slice whose model was set to
/// zero. Non-finite input voxels stay untouched in the output.
///
/// # Errors
/// [`ExtractError::Configuration`] for invalid parameters or unresolved
/// Angstrom masks and [`ExtractError::DataShape`] for a mask that does not
/// match the cube.
pub fn subtract_continuum(
    cube: &DataCube,
    config: &ContinuumConfig,
    exclude: Option<VoxelMask<'_>>,
) -> Result<ContinuumResult, ExtractError> {
    config.validate()?;
    let started = Instant::now();
    let shape = cube.dim();
    let (nz, ny, nx) = shape;

    let excluded_layers = config.excluded_layers(nz)?;
    let mut usable = combine_masks(shape, None, exclude)?;
    usable.zip_mut_with(&cube.data, |u, &v| *u &= v.is_finite());
    for (z, &skip) in excluded_layers.iter().enumerate() {
        if skip {
            usable.index_axis_mut(Axis(0), z).fill(false);
        }
    }

    log::debug!(
        "Continuum subtraction: {:?} along {:?} axis on {}x{}x{} cube ({} layers masked)",
        config.method,
        config.axis,
        nz,
        ny,
        nx,
        excluded_layers.iter().filter(|&&e| e).count()
    );

    let strategy = config.method.strategy();
    let required = strategy.required_samples(config.axis);
    let mut model = Array3::zeros(shape);
    let mut model_variance = cube.variance.as_ref().map(|_| Array3::zeros(shape));
    let mut diagnostics = Diagnostics::new();

    match config.axis {
        SliceAxis::Spectral => {
            let fits: Vec<(usize, Option<Fitted<Ix1>>, usize)> = (0..ny * nx)
                .into_par_iter()
                .map(|i| {
                    let (y, x) = (i / nx, i % nx);
                    let values = cube.data.slice(s![.., y, x]);
                    let variance = cube.variance.as_ref().map(|v| v.slice(s![.., y, x]));
                    let ok = usable.slice(s![.., y, x]);
                    let available = ok.iter().filter(|&&u| u).count();
                    let fit = if available >= required {
                        strategy.model_spectrum(&values, variance.as_ref(), &ok)
                    } else {
                        None
                    };
                    (i, fit, available)
                })
                .collect();

            for (i, fit, available) in fits {
                let (y, x) = (i / nx, i % nx);
                match fit {
                    Some(fitted) => {
                        model.slice_mut(s![.., y, x]).assign(&fitted.model);
                        if let (Some(total), Some(var)) = (model_variance.as_mut(), fitted.variance) {
                            total.slice_mut(s![.., y, x]).assign(&var);
                        }
                    }
                    None => diagnostics.push(Diagnostic::InsufficientData {
                        unit: format!("spaxel (y={y}, x={x})"),
                        available,
                        required,
                    }),
                }
            }
        }
        SliceAxis::Spatial => {
            let fits: Vec<(usize, Option<Fitted<Ix2>>, usize)> = (0..nz)
                .into_par_iter()
                .map(|z| {
                    let values = cube.data.index_axis(Axis(0), z);
                    let variance = cube.variance.as_ref().map(|v| v.index_axis(Axis(0), z));
                    let ok = usable.index_axis(Axis(0), z);
                    let available = ok.iter().filter(|&&u| u).count();
                    let fit = if available >= required {
                        strategy.model_layer(&values, variance.as_ref(), &ok)
                    } else {
                        None
                    };
                    (z, fit, available)
                })
                .collect();

            for (z, fit, available) in fits {
                match fit {
                    Some(fitted) => {
                        model.index_axis_mut(Axis(0), z).assign(&fitted.model);
                        if let (Some(total), Some(var)) = (model_variance.as_mut(), fitted.variance) {
                            total.index_axis_mut(Axis(0), z).assign(&var);
                        }
                    }
                    None => diagnostics.push(Diagnostic::InsufficientData {
                        unit: format!("layer {z}"),
                        available,
                        required,
                    }),
                }
            }
        }
    }

    let mut subtracted = cube.data.clone();
    Zip::from(&mut subtracted)
        .and(&model)
        .par_for_each(|d, &m| {
            if d.is_finite() {
                *d -= m;
            }
        });

    let variance = match (&cube.variance, &model_variance) {
        (Some(input), Some(added)) => {
            let mut total = input.clone();
            Zip::from(&mut total)
                .and(&cube.data)
                .and(added)
                .par_for_each(|v, &d, &m| {
                    if d.is_finite() && m.is_finite() {
                        *v += m;
                    }
                });
            Some(total)
        }
        _ => cube.variance.clone(),
    };

    log::info!(
        "Continuum subtraction done in {:.1} ms ({} slices unmodelled)",
        started.elapsed().as_secs_f64() * 1000.0,
        diagnostics.len()
    );

    Ok(ContinuumResult {
        subtracted: DataCube {
            data: subtracted,
            variance,
        },
        model,
        model_variance,
        diagnostics,
    })
}
