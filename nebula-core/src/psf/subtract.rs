//! Single-source subtraction.

use std::time::Instant;

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use nebula_math::Optimizer;
use rayon::prelude::*;

use super::fit::{fit_source, FitOutcome};
use super::slice::{subtract_slices_step, SliceSourceModel};
use super::{LayerAmplitude, PsfConfig, PsfMethod, SourceModel};
use crate::aperture::{local_background, CircularAperture};
use crate::cube::{white_light, window_layers, DataCube};
use crate::error::{Diagnostic, Diagnostics, ExtractError};

/// Output of point-source subtraction.
#[derive(Debug, Clone)]
pub struct PsfResult {
    /// Cube with every fitted source removed, with propagated variance.
    pub residual: DataCube,
    /// Sum of the subtracted source models.
    pub model: Array3<f64>,
    /// Union of the subtraction apertures.
    pub mask: Array2<bool>,
    /// Profile-fitted sources in subtraction order; skipped sources are
    /// absent.
    pub sources: Vec<SourceModel>,
    /// Sources modelled slice by slice, in subtraction order.
    pub slice_sources: Vec<SliceSourceModel>,
    /// Skipped sources and fit warnings.
    pub diagnostics: Diagnostics,
}

impl PsfResult {
    /// Initial fold state: nothing subtracted yet.
    pub(crate) fn start(cube: &DataCube) -> Self {
        let shape = cube.dim();
        Self {
            residual: cube.clone(),
            model: Array3::zeros(shape),
            mask: Array2::from_elem(cube.spatial_dim(), false),
            sources: Vec::new(),
            slice_sources: Vec::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    /// Number of sources subtracted by either method.
    pub fn source_count(&self) -> usize {
        self.sources.len() + self.slice_sources.len()
    }
}

/// Layers usable for white-light images: all layers outside `wmasks`.
pub(crate) fn usable_layers(nz: usize, config: &PsfConfig) -> Array1<bool> {
    Array1::from_shape_fn(nz, |z| {
        !config
            .wmasks
            .iter()
            .any(|&(a, b)| z >= a.min(b) && z <= a.max(b))
    })
}

/// Layers summed into the white-light image used for fitting.
pub(crate) fn fit_layers(nz: usize, config: &PsfConfig) -> Array1<bool> {
    let usable = usable_layers(nz, config);
    let center = config.wl_center.unwrap_or(nz / 2).min(nz.saturating_sub(1));
    let half_width = (config.wl_window > 0).then_some(config.wl_window / 2);
    window_layers(&usable.view(), center, half_width)
}

/// Least-squares amplitude of the unit profile in one layer.
///
/// `profile` pairs each fit-aperture pixel `(y, x)` with its unit profile
/// value.
fn layer_amplitude(
    layer: &ArrayView2<f64>,
    variance: Option<&ArrayView2<f64>>,
    profile: &[((usize, usize), f64)],
    center: (f64, f64),
    r_sub: f64,
) -> LayerAmplitude {
    let background = local_background(layer, center, r_sub).unwrap_or(0.0);

    let mut sum_pp = 0.0;
    let mut sum_pd = 0.0;
    let mut sum_ppv = 0.0;
    for &((y, x), p) in profile {
        let d = layer[[y, x]];
        if !d.is_finite() {
            continue;
        }
        sum_pp += p * p;
        sum_pd += p * (d - background);
        if let Some(var) = variance {
            let v = var[[y, x]];
            if v.is_finite() {
                sum_ppv += p * p * v;
            }
        }
    }

    if sum_pp <= 0.0 {
        return LayerAmplitude::NoModel;
    }

    let amplitude = sum_pd / sum_pp;
    LayerAmplitude::Fitted {
        amplitude: if amplitude.is_finite() && amplitude > 0.0 {
            amplitude
        } else {
            0.0
        },
        variance: variance.map(|_| sum_ppv / (sum_pp * sum_pp)),
    }
}

/// Model one source against the current residual and subtract it with the
/// configured method.
///
/// This is one step of the multi-source fold; a skipped source returns the
/// state unchanged apart from its diagnostics.
pub(crate) fn subtract_step(
    mut state: PsfResult,
    index: usize,
    position: (f64, f64),
    config: &PsfConfig,
    optimizer: &dyn Optimizer,
    layers: &ArrayView1<bool>,
) -> Result<PsfResult, ExtractError> {
    let (_, ny, nx) = state.residual.dim();
    let (px, py) = position;

    if !(px >= -0.5 && py >= -0.5 && px < nx as f64 - 0.5 && py < ny as f64 - 0.5) {
        state.diagnostics.push(Diagnostic::SourceSkipped {
            source: index,
            position,
            reason: "position outside the image".to_string(),
        });
        return Ok(state);
    }

    match &config.method {
        PsfMethod::Profile => subtract_profile_step(state, index, position, config, optimizer, layers),
        PsfMethod::Slices(settings) => subtract_slices_step(state, index, position, config, settings),
    }
}

/// Fit an analytic profile on the white-light image and subtract it layer
/// by layer.
fn subtract_profile_step(
    mut state: PsfResult,
    index: usize,
    position: (f64, f64),
    config: &PsfConfig,
    optimizer: &dyn Optimizer,
    layers: &ArrayView1<bool>,
) -> Result<PsfResult, ExtractError> {
    let (nz, ny, nx) = state.residual.dim();
    let (px, py) = position;

    let (image, _) = white_light(&state.residual.data.view(), None, layers);
    let seed = config.seed.wrapping_add(index as u64);

    let fit = match fit_source(&image.view(), position, config, optimizer, seed)? {
        FitOutcome::Fitted(fit) => fit,
        FitOutcome::Underdetermined {
            available,
            required,
        } => {
            state.diagnostics.push(Diagnostic::InsufficientData {
                unit: format!("source {index} fit aperture"),
                available,
                required,
            });
            return Ok(state);
        }
    };

    if config.recenter && !fit.converged {
        state.diagnostics.push(Diagnostic::RecenterNotConverged {
            source: index,
            iterations: fit.iterations,
            last_shift: fit.last_shift,
        });
    }
    for &(parameter, value) in &fit.pinned {
        state.diagnostics.push(Diagnostic::FitAtBound {
            source: index,
            parameter,
            value,
        });
    }

    let model = fit.model;
    let center = model.center;
    let unit_at = |pixels: Vec<(usize, usize)>| -> Vec<((usize, usize), f64)> {
        pixels
            .into_iter()
            .map(|(y, x)| ((y, x), model.unit(x as f64, y as f64)))
            .collect()
    };
    let fit_profile = unit_at(CircularAperture::new(center, config.r_fit).pixels((ny, nx)));
    let sub_profile = unit_at(CircularAperture::new(center, config.r_sub).pixels((ny, nx)));

    let amplitudes: Vec<LayerAmplitude> = {
        let data = &state.residual.data;
        let variance = state.residual.variance.as_ref();
        (0..nz)
            .into_par_iter()
            .map(|z| {
                let layer = data.index_axis(Axis(0), z);
                let var_layer = variance.map(|v| v.index_axis(Axis(0), z));
                layer_amplitude(&layer, var_layer.as_ref(), &fit_profile, center, config.r_sub)
            })
            .collect()
    };

    for (z, amplitude) in amplitudes.iter().enumerate() {
        let LayerAmplitude::Fitted {
            amplitude,
            variance: amplitude_var,
        } = *amplitude
        else {
            continue;
        };
        if amplitude == 0.0 {
            continue;
        }

        for &((y, x), p) in &sub_profile {
            let m = amplitude * p;
            state.model[[z, y, x]] += m;
            state.residual.data[[z, y, x]] -= m;
            if let (Some(var), Some(va)) = (state.residual.variance.as_mut(), amplitude_var) {
                var[[z, y, x]] += p * p * va;
            }
        }
    }

    for &((y, x), _) in &sub_profile {
        state.mask[[y, x]] = true;
    }

    log::debug!(
        "Source {} at ({:.2}, {:.2}): fitted ({:.3}, {:.3}), amplitude {:.4}, {} iterations",
        index,
        px,
        py,
        center.0,
        center.1,
        model.amplitude,
        fit.iterations
    );

    state.sources.push(SourceModel {
        index,
        nominal: position,
        profile: model,
        amplitudes,
        recenter_iterations: fit.iterations,
        converged: fit.converged,
        cost: fit.cost,
    });

    Ok(state)
}

/// Fit and subtract one point source.
///
/// # Arguments
/// * `cube` - Data and optional variance
/// * `position` - Nominal source position `(x, y)` in pixels
/// * `config` - Radii, profile, recentering and white-light settings
/// * `optimizer` - Bounded minimizer used for the white-light fit
///
/// # Returns
/// Residual cube, model cube, subtraction mask, the fitted source (absent
/// when skipped) and diagnostics. A source whose fitted amplitude is zero
/// in every layer leaves the cube untouched.
pub fn psf_sub(
    cube: &DataCube,
    position: (f64, f64),
    config: &PsfConfig,
    optimizer: &dyn Optimizer,
) -> Result<PsfResult, ExtractError> {
    config.validate()?;
    let started = Instant::now();
    let (nz, _, _) = cube.dim();
    let layers = fit_layers(nz, config);

    log::debug!("PSF subtraction config: {config:?}");
    let result = subtract_step(PsfResult::start(cube), 0, position, config, optimizer, &layers.view())?;

    log::info!(
        "Subtracted {} point source(s) in {:.1} ms",
        result.source_count(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::PsfProfile;
    use approx::assert_abs_diff_eq;
    use nebula_math::DifferentialEvolution;
    use test_helpers::{inject_gaussian_source, uniform_cube};

    fn source_cube() -> Array3<f64> {
        let mut data = uniform_cube((6, 15, 15), 2.0);
        inject_gaussian_source(&mut data, (7.2, 6.8), 40.0, 1.3, 0..6);
        data
    }

    fn config() -> PsfConfig {
        PsfConfig {
            r_fit: 3.0,
            r_sub: 5.0,
            ..PsfConfig::default()
        }
    }

    #[test]
    fn test_subtracts_source_and_keeps_background() {
        let data = source_cube();
        let cube = DataCube::without_variance(data.clone());

        let result = psf_sub(&cube, (7.0, 7.0), &config(), &DifferentialEvolution::default()).unwrap();
        assert_eq!(result.sources.len(), 1);
        let source = &result.sources[0];
        assert_abs_diff_eq!(source.center().0, 7.2, epsilon = 1e-2);
        assert_abs_diff_eq!(source.center().1, 6.8, epsilon = 1e-2);

        for z in 0..6 {
            assert_abs_diff_eq!(source.amplitudes[z].value().unwrap(), 40.0, epsilon = 0.2);
            assert_abs_diff_eq!(result.residual.data[[z, 7, 7]], 2.0, epsilon = 0.2);
            // Outside the subtraction radius nothing changes.
            assert_eq!(result.residual.data[[z, 0, 0]], data[[z, 0, 0]]);
        }
        assert!(result.mask[[7, 7]] && !result.mask[[0, 0]]);
    }

    #[test]
    fn test_null_source_leaves_cube_unchanged() {
        let data = uniform_cube((4, 12, 12), 5.0);
        let var = Array3::from_elem((4, 12, 12), 1.0);
        let cube = DataCube::new(data.clone(), Some(var.clone())).unwrap();

        let result = psf_sub(&cube, (6.0, 6.0), &config(), &DifferentialEvolution::default()).unwrap();
        let source = &result.sources[0];
        for amplitude in &source.amplitudes {
            assert_eq!(amplitude.value(), Some(0.0));
        }
        assert_eq!(result.residual.data, data);
        assert_eq!(result.residual.variance, Some(var));
        assert!(result.model.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_negative_amplitude_clamped_to_zero() {
        let mut data = uniform_cube((2, 12, 12), 5.0);
        inject_gaussian_source(&mut data, (6.0, 6.0), -10.0, 1.0, 0..2);
        let cube = DataCube::without_variance(data.clone());

        let result = psf_sub(&cube, (6.0, 6.0), &config(), &DifferentialEvolution::default()).unwrap();
        assert_eq!(result.residual.data, data);
    }

    #[test]
    fn test_variance_gains_amplitude_uncertainty() {
        let data = source_cube();
        let var = Array3::from_elem(data.dim(), 0.5);
        let cube = DataCube::new(data, Some(var.clone())).unwrap();

        let result = psf_sub(&cube, (7.0, 7.0), &config(), &DifferentialEvolution::default()).unwrap();
        let out_var = result.residual.variance.as_ref().unwrap();
        let source = &result.sources[0];

        // Never below the input variance, unchanged outside r_sub.
        for (&v_out, &v_in) in out_var.iter().zip(var.iter()) {
            assert!(v_out >= v_in);
        }
        assert_eq!(out_var[[0, 0, 0]], 0.5);

        // At the profile peak the added term is the amplitude variance.
        let LayerAmplitude::Fitted {
            variance: Some(va), ..
        } = source.amplitudes[2]
        else {
            panic!("expected a fitted layer with variance");
        };
        let p = source.profile.unit(7.0, 7.0);
        assert_abs_diff_eq!(out_var[[2, 7, 7]], 0.5 + p * p * va, epsilon = 1e-12);
        assert!(va > 0.0);
    }

    #[test]
    fn test_layer_without_finite_samples_has_no_model() {
        let mut data = source_cube();
        data.index_axis_mut(Axis(0), 3).fill(f64::NAN);
        let cube = DataCube::without_variance(data);

        let result = psf_sub(&cube, (7.0, 7.0), &config(), &DifferentialEvolution::default()).unwrap();
        assert_eq!(result.sources[0].amplitudes[3], LayerAmplitude::NoModel);
        assert!(result.residual.data[[3, 7, 7]].is_nan());
        assert!(result.sources[0].amplitudes[2].value().is_some());
    }

    #[test]
    fn test_out_of_image_position_is_skipped() {
        let cube = DataCube::without_variance(source_cube());
        let result = psf_sub(&cube, (40.0, 3.0), &config(), &DifferentialEvolution::default()).unwrap();
        assert!(result.sources.is_empty());
        assert!(matches!(
            result.diagnostics.iter().next(),
            Some(Diagnostic::SourceSkipped { source: 0, .. })
        ));
        assert_eq!(result.residual, cube);
    }

    #[test]
    fn test_seeded_fit_is_reproducible() {
        let cube = DataCube::without_variance(source_cube());
        let config = PsfConfig {
            profile: PsfProfile::Moffat,
            seed: 17,
            ..config()
        };
        let de = DifferentialEvolution::default();

        let a = psf_sub(&cube, (7.0, 7.0), &config, &de).unwrap();
        let b = psf_sub(&cube, (7.0, 7.0), &config, &de).unwrap();
        assert_eq!(a.sources, b.sources);
        assert_eq!(a.residual, b.residual);
    }

    #[test]
    fn test_fit_layers_window() {
        let config = PsfConfig {
            wl_window: 4,
            wl_center: Some(5),
            wmasks: vec![(5, 5)],
            ..PsfConfig::default()
        };
        let layers = fit_layers(12, &config);
        // Half-width 2 around an excluded layer 5 holds 4 layers; growing
        // the reach by one adds a layer on each side.
        assert_eq!(layers.iter().filter(|&&l| l).count(), 6);
        assert!(layers[2] && layers[8] && !layers[9]);
        assert!(!layers[5]);
    }
}
