//! Slice-by-slice empirical point-source subtraction.
//!
//! Slicer IFUs resample every slice on its own, so an analytic 2D profile
//! can leave structured residuals along the slices. This method models each
//! slice near the source separately. In every layer, the slice's
//! white-light profile (the mean over a window of `wl_window` layers around
//! that layer, skipping `wmasks`) is the model shape, and its scale is the
//! ratio of the layer's flux to the white-light flux inside `r_fit`. Both
//! profiles have their median outside `r_sub` removed first when enough
//! pixels lie there.
//!
//! A slice is modelled in a layer only when its white-light profile is a
//! clear detection: flux inside `r_fit` over the profile's standard
//! deviation must reach `min_snr`. The subtracted voxels receive
//! `scale^2 * var(white-light profile)` on top of their own variance.

use ndarray::{Array1, Array2, ArrayView3};
use nebula_math::{median, std_dev};
use rayon::prelude::*;
use serde::Serialize;

use super::subtract::{usable_layers, PsfResult};
use super::{PsfConfig, SliceDirection, SliceSettings};
use crate::aperture::MIN_BACKGROUND_PIXELS;
use crate::cube::window_layers;
use crate::error::{Diagnostic, ExtractError};

/// Point source modelled slice by slice, as subtracted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceSourceModel {
    /// Position in subtraction order.
    pub index: usize,
    /// Source position `(x, y)`.
    pub nominal: (f64, f64),
    /// Slice orientation.
    pub direction: SliceDirection,
    /// First and last modelled slice, inclusive.
    pub slices: (usize, usize),
    /// Scale per `(layer, slice - first)`; `None` where the white-light
    /// profile did not pass the detection threshold.
    pub scales: Array2<Option<f64>>,
}

impl SliceSourceModel {
    /// Number of `(layer, slice)` pairs that were modelled.
    pub fn modelled(&self) -> usize {
        self.scales.iter().filter(|s| s.is_some()).count()
    }
}

struct SliceGeometry {
    direction: SliceDirection,
    /// Profile coordinate of the source.
    center: f64,
    profile_len: usize,
}

impl SliceGeometry {
    /// Image index `(y, x)` of position `t` along `slice`.
    fn voxel(&self, slice: usize, t: usize) -> (usize, usize) {
        match self.direction {
            SliceDirection::Columns => (t, slice),
            SliceDirection::Rows => (slice, t),
        }
    }

    fn index(&self, z: usize, slice: usize, t: usize) -> [usize; 3] {
        let (y, x) = self.voxel(slice, t);
        [z, y, x]
    }

    fn within(&self, radius: f64) -> Vec<usize> {
        (0..self.profile_len)
            .filter(|&t| (t as f64 - self.center).abs() <= radius)
            .collect()
    }
}

/// Model of one slice in one layer.
struct SliceUpdate {
    slice: usize,
    scale: f64,
    /// `(t, model value, added variance)` for every subtracted pixel.
    pixels: Vec<(usize, f64, f64)>,
}

/// Mean profile of `slice` over `layers`, and the variance of that mean.
fn white_light_profile(
    data: &ArrayView3<f64>,
    variance: Option<&ArrayView3<f64>>,
    layers: &[usize],
    geometry: &SliceGeometry,
    slice: usize,
) -> (Array1<f64>, Array1<f64>) {
    let mut profile = Array1::from_elem(geometry.profile_len, f64::NAN);
    let mut profile_var = Array1::zeros(geometry.profile_len);

    for t in 0..geometry.profile_len {
        let (y, x) = geometry.voxel(slice, t);
        let mut sum = 0.0;
        let mut var_sum = 0.0;
        let mut n = 0usize;
        for &z in layers {
            let d = data[[z, y, x]];
            if !d.is_finite() {
                continue;
            }
            sum += d;
            n += 1;
            if let Some(var) = variance {
                let v = var[[z, y, x]];
                if v.is_finite() {
                    var_sum += v;
                }
            }
        }
        if n > 0 {
            profile[t] = sum / n as f64;
            profile_var[t] = var_sum / (n * n) as f64;
        }
    }
    (profile, profile_var)
}

/// Subtract the median of the finite pixels farther than `r_sub` from the
/// source, when enough of them exist.
fn remove_background(profile: &mut Array1<f64>, geometry: &SliceGeometry, r_sub: f64) {
    let outside: Vec<f64> = profile
        .iter()
        .enumerate()
        .filter(|&(t, v)| v.is_finite() && (t as f64 - geometry.center).abs() > r_sub)
        .map(|(_, &v)| v)
        .collect();
    if outside.len() < MIN_BACKGROUND_PIXELS {
        return;
    }
    if let Ok(level) = median(&outside) {
        profile.mapv_inplace(|v| v - level);
    }
}

#[allow(clippy::too_many_arguments)]
fn model_slice(
    data: &ArrayView3<f64>,
    variance: Option<&ArrayView3<f64>>,
    z: usize,
    layers: &[usize],
    geometry: &SliceGeometry,
    slice: usize,
    config: &PsfConfig,
    settings: &SliceSettings,
) -> Option<SliceUpdate> {
    let (mut wl, wl_var) = white_light_profile(data, variance, layers, geometry, slice);
    remove_background(&mut wl, geometry, config.r_sub);

    let fit = geometry.within(config.r_fit);
    let wl_flux: f64 = fit.iter().map(|&t| wl[t]).filter(|v| v.is_finite()).sum();
    let finite: Vec<f64> = wl.iter().copied().filter(|v| v.is_finite()).collect();
    let noise = std_dev(&finite).ok()?;
    if !(noise > 0.0 && wl_flux > 0.0) || wl_flux / noise < settings.min_snr {
        return None;
    }

    let mut layer =
        Array1::from_shape_fn(geometry.profile_len, |t| data[geometry.index(z, slice, t)]);
    remove_background(&mut layer, geometry, config.r_sub);

    let (layer_flux, matched_flux) = fit
        .iter()
        .filter(|&&t| wl[t].is_finite() && layer[t].is_finite())
        .fold((0.0, 0.0), |(l, w), &t| (l + layer[t], w + wl[t]));
    if !(matched_flux > 0.0) {
        return None;
    }
    let ratio = layer_flux / matched_flux;
    let scale = if ratio.is_finite() && ratio > 0.0 {
        ratio
    } else {
        0.0
    };

    let pixels = geometry
        .within(config.r_sub)
        .into_iter()
        .filter(|&t| wl[t].is_finite() && data[geometry.index(z, slice, t)].is_finite())
        .map(|t| (t, scale * wl[t], scale * scale * wl_var[t]))
        .collect();

    Some(SliceUpdate {
        slice,
        scale,
        pixels,
    })
}

/// Model the slices around one source layer by layer and subtract them.
///
/// One step of the multi-source fold; every layer is modelled from the
/// residual as it stood before this source.
pub(crate) fn subtract_slices_step(
    mut state: PsfResult,
    index: usize,
    position: (f64, f64),
    config: &PsfConfig,
    settings: &SliceSettings,
) -> Result<PsfResult, ExtractError> {
    let (nz, ny, nx) = state.residual.dim();
    let (px, py) = position;
    let (slice_count, profile_len, slice_position, center) = match settings.direction {
        SliceDirection::Columns => (nx, ny, px, py),
        SliceDirection::Rows => (ny, nx, py, px),
    };
    let geometry = SliceGeometry {
        direction: settings.direction,
        center,
        profile_len,
    };

    let source_slice = (slice_position.round().max(0.0) as usize).min(slice_count.saturating_sub(1));
    let first = source_slice.saturating_sub(settings.slice_radius);
    let last = (source_slice + settings.slice_radius).min(slice_count.saturating_sub(1));

    let usable = usable_layers(nz, config);
    let half_width = (config.wl_window > 0).then_some(config.wl_window / 2);

    let updates: Vec<Vec<Option<SliceUpdate>>> = {
        let data = state.residual.data.view();
        let variance = state.residual.variance.as_ref().map(|v| v.view());
        (0..nz)
            .into_par_iter()
            .map(|z| {
                let window = window_layers(&usable.view(), z, half_width);
                let layers: Vec<usize> = window
                    .iter()
                    .enumerate()
                    .filter(|&(_, &selected)| selected)
                    .map(|(i, _)| i)
                    .collect();
                (first..=last)
                    .map(|slice| {
                        model_slice(
                            &data,
                            variance.as_ref(),
                            z,
                            &layers,
                            &geometry,
                            slice,
                            config,
                            settings,
                        )
                    })
                    .collect()
            })
            .collect()
    };

    let mut scales = Array2::from_elem((nz, last - first + 1), None);
    for (z, layer) in updates.into_iter().enumerate() {
        for update in layer.into_iter().flatten() {
            scales[[z, update.slice - first]] = Some(update.scale);
            for (t, m, v) in update.pixels {
                let idx = geometry.index(z, update.slice, t);
                state.model[idx] += m;
                state.residual.data[idx] -= m;
                if let Some(var) = state.residual.variance.as_mut() {
                    var[idx] += v;
                }
            }
        }
    }

    let source = SliceSourceModel {
        index,
        nominal: position,
        direction: settings.direction,
        slices: (first, last),
        scales,
    };
    if source.modelled() == 0 {
        state.diagnostics.push(Diagnostic::SourceSkipped {
            source: index,
            position,
            reason: format!(
                "no slice reached white-light SNR {} within r_fit",
                settings.min_snr
            ),
        });
        return Ok(state);
    }

    let subtracted = geometry.within(config.r_sub);
    for slice in first..=last {
        for &t in &subtracted {
            let (y, x) = geometry.voxel(slice, t);
            state.mask[[y, x]] = true;
        }
    }

    log::debug!(
        "Source {} at ({:.2}, {:.2}): {} of {} slice-layers modelled over slices {}..={}",
        index,
        px,
        py,
        source.modelled(),
        source.scales.len(),
        first,
        last
    );

    state.slice_sources.push(source);
    Ok(state)
}
