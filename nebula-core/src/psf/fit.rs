//! Bounded profile fitting on white-light images.
//!
//! Each fit minimises the residual sum of squares between the profile and
//! the background-subtracted image over the pixels within `r_fit` of the
//! current aperture center. With recentering enabled the fit is repeated
//! around the fitted center until the shift drops below tolerance or the
//! iteration cap is reached.
//!
//! The optimizer bounds always keep the center within `r_fit` of the
//! nominal position, and the aperture never moves farther than `r_fit`
//! from it, so recentering cannot wander away from the requested source.

use ndarray::ArrayView2;
use nebula_math::Optimizer;

use super::profile::ProfileModel;
use super::PsfConfig;
use crate::aperture::{local_background, CircularAperture};
use crate::error::ExtractError;

/// Relative distance to a bound (as a fraction of the bound width) below
/// which a fitted parameter is reported as pinned.
const BOUND_TOLERANCE: f64 = 1e-3;

/// States of the recentering loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecenterState {
    /// Fit around the current center.
    Fitting,
    /// Compare the fitted center with the one the fit started from.
    CheckConvergence,
    /// Stop and keep the last fit.
    Done,
}

/// Successful white-light fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedProfile {
    /// Fitted profile in image coordinates.
    pub model: ProfileModel,
    /// Residual sum of squares of the last fit.
    pub cost: f64,
    /// Fits executed, including a final one that found too few pixels.
    pub iterations: usize,
    /// Whether the last center shift was below tolerance. Always true when
    /// recentering is disabled or the aperture holds no positive signal.
    pub converged: bool,
    /// Center shift of the last iteration in pixels.
    pub last_shift: f64,
    /// Parameters of the last fit lying on an optimizer bound, with their
    /// values.
    pub pinned: Vec<(&'static str, f64)>,
}

/// Result of [`fit_source`].
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// The profile was fitted.
    Fitted(FittedProfile),
    /// The first fit aperture held fewer finite pixels than free
    /// parameters.
    Underdetermined {
        /// Finite pixels in the aperture.
        available: usize,
        /// Free profile parameters.
        required: usize,
    },
}

struct SingleFit {
    model: ProfileModel,
    cost: f64,
    pinned: Vec<(&'static str, f64)>,
    /// Amplitude at its lower bound: nothing to recenter on.
    no_signal: bool,
}

/// Point within `radius` of `anchor` closest to `point`.
fn clamp_to_disk(point: (f64, f64), anchor: (f64, f64), radius: f64) -> (f64, f64) {
    let dx = point.0 - anchor.0;
    let dy = point.1 - anchor.1;
    let distance = dx.hypot(dy);
    if distance <= radius {
        point
    } else {
        let k = radius / distance;
        (anchor.0 + dx * k, anchor.1 + dy * k)
    }
}

/// One bounded fit with the aperture at `center` and the center bounds
/// around `nominal`; `Err(available)` when the aperture is too sparse.
fn fit_once(
    image: &ArrayView2<f64>,
    center: (f64, f64),
    nominal: (f64, f64),
    config: &PsfConfig,
    optimizer: &dyn Optimizer,
    seed: u64,
) -> Result<Result<SingleFit, usize>, ExtractError> {
    let background = local_background(image, center, config.r_sub).unwrap_or(0.0);

    let samples: Vec<(f64, f64, f64)> = CircularAperture::new(center, config.r_fit)
        .pixels(image.dim())
        .into_iter()
        .map(|(y, x)| (x as f64, y as f64, image[[y, x]]))
        .filter(|(_, _, v)| v.is_finite())
        .map(|(x, y, v)| (x, y, v - background))
        .collect();

    let profile = config.profile;
    if samples.len() < profile.parameter_count() {
        return Ok(Err(samples.len()));
    }

    let peak = samples
        .iter()
        .map(|&(_, _, v)| v)
        .fold(f64::NEG_INFINITY, f64::max);
    let bounds = profile.bounds(nominal, peak, config.r_fit, config.r_sub);

    let objective = |params: &[f64]| -> f64 {
        let model = profile.model(params);
        samples
            .iter()
            .map(|&(x, y, v)| {
                let r = model.eval(x, y) - v;
                r * r
            })
            .sum()
    };

    let minimum = optimizer.minimize(&objective, &bounds, seed)?;
    let names = profile.parameter_names();
    let pinned: Vec<(&'static str, f64)> = minimum
        .parameters_at_bounds(&bounds, BOUND_TOLERANCE)
        .into_iter()
        .map(|i| (names[i], minimum.params[i]))
        .collect();

    let (amplitude_lo, amplitude_hi) = bounds[0];
    let no_signal = peak <= 0.0
        || minimum.params[0] - amplitude_lo <= BOUND_TOLERANCE * (amplitude_hi - amplitude_lo);

    Ok(Ok(SingleFit {
        model: profile.model(&minimum.params),
        cost: minimum.cost,
        pinned,
        no_signal,
    }))
}

/// Fit the configured profile to a white-light image.
///
/// # Arguments
/// * `image` - White-light image
/// * `nominal` - Starting position `(x, y)`
/// * `config` - Radii, profile family and recentering settings
/// * `optimizer` - Bounded minimizer
/// * `seed` - Optimizer seed, reused for every recentering iteration
///
/// # Returns
/// The last successful fit, or [`FitOutcome::Underdetermined`] when the
/// first aperture lacks data. A later pass that finds too few pixels ends
/// the loop with the previous fit and `converged == false`, as does hitting
/// `max_recenter_iterations`; neither is an error.
///
/// A fit whose amplitude sits at zero stops immediately and reports the
/// aperture center, since an empty profile has no position to converge on.
pub fn fit_source(
    image: &ArrayView2<f64>,
    nominal: (f64, f64),
    config: &PsfConfig,
    optimizer: &dyn Optimizer,
    seed: u64,
) -> Result<FitOutcome, ExtractError> {
    let mut state = RecenterState::Fitting;
    let mut center = nominal;
    let mut iterations = 0;
    let mut last: Option<SingleFit> = None;
    let mut last_shift = 0.0;
    let mut converged = false;

    loop {
        match state {
            RecenterState::Fitting => {
                iterations += 1;
                match fit_once(image, center, nominal, config, optimizer, seed)? {
                    Ok(fit) => {
                        last = Some(fit);
                        state = RecenterState::CheckConvergence;
                    }
                    Err(available) if last.is_none() => {
                        return Ok(FitOutcome::Underdetermined {
                            available,
                            required: config.profile.parameter_count(),
                        })
                    }
                    Err(available) => {
                        log::debug!(
                            "Recentered aperture at ({:.3}, {:.3}) holds {} finite pixels; keeping previous fit",
                            center.0,
                            center.1,
                            available
                        );
                        state = RecenterState::Done;
                    }
                }
            }
            RecenterState::CheckConvergence => {
                let Some(fit) = last.as_mut() else {
                    state = RecenterState::Fitting;
                    continue;
                };

                if fit.no_signal {
                    fit.model.center = center;
                    last_shift = 0.0;
                    converged = true;
                    state = RecenterState::Done;
                    continue;
                }

                let (fx, fy) = fit.model.center;
                last_shift = (fx - center.0).hypot(fy - center.1);

                log::debug!(
                    "Fit {} around ({:.3}, {:.3}): center ({:.3}, {:.3}), shift {:.4} px",
                    iterations,
                    center.0,
                    center.1,
                    fx,
                    fy,
                    last_shift
                );

                if !config.recenter || last_shift < config.recenter_tolerance {
                    converged = true;
                    state = RecenterState::Done;
                } else if iterations >= config.max_recenter_iterations {
                    state = RecenterState::Done;
                } else {
                    center = clamp_to_disk((fx, fy), nominal, config.r_fit);
                    state = RecenterState::Fitting;
                }
            }
            RecenterState::Done => break,
        }
    }

    match last {
        Some(fit) => Ok(FitOutcome::Fitted(FittedProfile {
            model: fit.model,
            cost: fit.cost,
            iterations,
            converged,
            last_shift,
            pinned: fit.pinned,
        })),
        None => Ok(FitOutcome::Underdetermined {
            available: 0,
            required: config.profile.parameter_count(),
        }),
    }
}
