//! Analytic point-source profiles.
//!
//! Both families are written as a peak amplitude times a unit-peak shape:
//!
//! - Gaussian: `A * exp(-r^2 / (2 sigma^2))`, parameters `(A, x0, y0, sigma)`
//! - Moffat: `A * (1 + r^2 / gamma^2)^(-alpha)`, parameters
//!   `(A, x0, y0, gamma, alpha)`

use serde::Serialize;

use super::PsfProfile;

/// Lower bound on profile widths, in pixels.
pub const MIN_WIDTH: f64 = 0.3;

/// Bounds of the Moffat power index.
pub const MOFFAT_ALPHA_BOUNDS: (f64, f64) = (1.0, 10.0);

/// Shape parameters of a fitted profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ProfileShape {
    /// Circular Gaussian.
    Gaussian {
        /// Standard deviation in pixels.
        sigma: f64,
    },
    /// Circular Moffat.
    Moffat {
        /// Core width in pixels.
        gamma: f64,
        /// Power index.
        alpha: f64,
    },
}

impl ProfileShape {
    /// Unit-peak value at squared radius `r2`.
    pub fn unit_value(&self, r2: f64) -> f64 {
        match *self {
            ProfileShape::Gaussian { sigma } => (-r2 / (2.0 * sigma * sigma)).exp(),
            ProfileShape::Moffat { gamma, alpha } => (1.0 + r2 / (gamma * gamma)).powf(-alpha),
        }
    }

    /// Family this shape belongs to.
    pub fn family(&self) -> PsfProfile {
        match self {
            ProfileShape::Gaussian { .. } => PsfProfile::Gaussian,
            ProfileShape::Moffat { .. } => PsfProfile::Moffat,
        }
    }
}

/// Fully parameterised 2D profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileModel {
    /// Peak amplitude.
    pub amplitude: f64,
    /// Center `(x, y)` in pixels.
    pub center: (f64, f64),
    /// Shape parameters.
    pub shape: ProfileShape,
}

impl ProfileModel {
    /// Model value at pixel `(x, y)`.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        self.amplitude * self.unit(x, y)
    }

    /// Unit-peak shape value at pixel `(x, y)`.
    pub fn unit(&self, x: f64, y: f64) -> f64 {
        let dx = x - self.center.0;
        let dy = y - self.center.1;
        self.shape.unit_value(dx * dx + dy * dy)
    }
}

impl PsfProfile {
    /// Names of the optimizer parameters, in vector order.
    pub fn parameter_names(&self) -> &'static [&'static str] {
        match self {
            PsfProfile::Gaussian => &["amplitude", "x0", "y0", "sigma"],
            PsfProfile::Moffat => &["amplitude", "x0", "y0", "gamma", "alpha"],
        }
    }

    /// Number of free parameters.
    pub fn parameter_count(&self) -> usize {
        self.parameter_names().len()
    }

    /// Optimizer bounds for a fit around `center`.
    ///
    /// # Arguments
    /// * `center` - Current aperture center `(x, y)`
    /// * `peak` - Largest value inside the fit aperture
    /// * `r_fit` - Fit radius; the fitted center stays within this distance
    ///   along each axis
    /// * `r_sub` - Subtraction radius; upper bound on the width
    pub fn bounds(&self, center: (f64, f64), peak: f64, r_fit: f64, r_sub: f64) -> Vec<(f64, f64)> {
        let amplitude_max = 2.0 * peak.max(f64::EPSILON);
        let width_max = r_sub.max(MIN_WIDTH * 2.0);
        let mut bounds = vec![
            (0.0, amplitude_max),
            (center.0 - r_fit, center.0 + r_fit),
            (center.1 - r_fit, center.1 + r_fit),
            (MIN_WIDTH, width_max),
        ];
        if let PsfProfile::Moffat = self {
            bounds.push(MOFFAT_ALPHA_BOUNDS);
        }
        bounds
    }

    /// Build a model from an optimizer parameter vector.
    pub fn model(&self, params: &[f64]) -> ProfileModel {
        let shape = match self {
            PsfProfile::Gaussian => ProfileShape::Gaussian { sigma: params[3] },
            PsfProfile::Moffat => ProfileShape::Moffat {
                gamma: params[3],
                alpha: params[4],
            },
        };
        ProfileModel {
            amplitude: params[0],
            center: (params[1], params[2]),
            shape,
        }
    }
}
