//! Least-squares polynomial fitting.
//!
//! Curves and surfaces are fitted by building the Vandermonde design
//! matrix and solving it through its SVD pseudo-inverse, which stays well
//! behaved for the low orders used in continuum modeling. Abscissae are
//! mapped onto `[-1, 1]` before fitting so that high powers of
//! wavelength-layer indices do not dominate the conditioning.
//!
//! When per-sample variances are supplied, the coefficient covariance
//! `A⁺ diag(var) A⁺ᵀ` is kept with the fit so that the variance of the
//! model can be evaluated anywhere.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors from polynomial fitting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Fewer samples than free coefficients.
    #[error("underdetermined fit: {samples} samples for {coefficients} coefficients")]
    Underdetermined {
        /// Number of usable samples.
        samples: usize,
        /// Number of coefficients the model needs.
        coefficients: usize,
    },

    /// Input slices have different lengths.
    #[error("length mismatch: {0}")]
    LengthMismatch(String),

    /// The SVD solve failed.
    #[error("least-squares solve failed: {0}")]
    Solve(String),
}

/// Maps an interval onto `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Normalization {
    center: f64,
    half_range: f64,
}

impl Normalization {
    fn from_samples(values: &[f64]) -> Self {
        let (lo, hi) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let half_range = (hi - lo) / 2.0;
        Self {
            center: (hi + lo) / 2.0,
            half_range: if half_range > 0.0 { half_range } else { 1.0 },
        }
    }

    fn apply(&self, v: f64) -> f64 {
        (v - self.center) / self.half_range
    }
}

/// A fitted 1D polynomial.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    /// Coefficients in ascending power of the normalized abscissa.
    coefficients: Vec<f64>,
    covariance: Option<DMatrix<f64>>,
    norm: Normalization,
}

impl Polynomial {
    /// Polynomial order.
    pub fn order(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// Evaluate at an abscissa in the caller's original units.
    pub fn eval(&self, x: f64) -> f64 {
        let t = self.norm.apply(x);
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * t + c)
    }

    /// Variance of the model at `x`, when the fit was given sample
    /// variances.
    pub fn eval_variance(&self, x: f64) -> Option<f64> {
        let t = self.norm.apply(x);
        let basis = DVector::from_fn(self.coefficients.len(), |i, _| t.powi(i as i32));
        self.covariance.as_ref().map(|c| quadratic_form(c, &basis))
    }
}

/// A fitted 2D polynomial surface of bounded total degree.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialSurface {
    degree: usize,
    /// Coefficients ordered as produced by [`surface_terms`].
    coefficients: Vec<f64>,
    covariance: Option<DMatrix<f64>>,
    norm_x: Normalization,
    norm_y: Normalization,
}

impl PolynomialSurface {
    /// Total degree of the surface.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Evaluate at `(x, y)` in the caller's original units.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let u = self.norm_x.apply(x);
        let v = self.norm_y.apply(y);
        surface_terms(self.degree)
            .zip(self.coefficients.iter())
            .map(|((i, j), &c)| c * u.powi(i as i32) * v.powi(j as i32))
            .sum()
    }

    /// Variance of the surface at `(x, y)`, when the fit was given sample
    /// variances.
    pub fn eval_variance(&self, x: f64, y: f64) -> Option<f64> {
        let u = self.norm_x.apply(x);
        let v = self.norm_y.apply(y);
        let terms: Vec<(usize, usize)> = surface_terms(self.degree).collect();
        let basis = DVector::from_fn(terms.len(), |row, _| {
            let (i, j) = terms[row];
            u.powi(i as i32) * v.powi(j as i32)
        });
        self.covariance.as_ref().map(|c| quadratic_form(c, &basis))
    }
}

/// Number of coefficients in a surface of the given total degree.
pub fn surface_coefficient_count(degree: usize) -> usize {
    (degree + 1) * (degree + 2) / 2
}

/// Exponent pairs `(i, j)` with `i + j <= degree`.
fn surface_terms(degree: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..=degree).flat_map(move |total| (0..=total).map(move |j| (total - j, j)))
}

/// `bᵀ C b`.
fn quadratic_form(covariance: &DMatrix<f64>, basis: &DVector<f64>) -> f64 {
    basis.dot(&(covariance * basis))
}

struct LeastSquares {
    coefficients: Vec<f64>,
    covariance: Option<DMatrix<f64>>,
}

fn solve_least_squares(
    design: DMatrix<f64>,
    rhs: DVector<f64>,
    variance: Option<&[f64]>,
) -> Result<LeastSquares, FitError> {
    let pinv = design
        .svd(true, true)
        .pseudo_inverse(1e-12)
        .map_err(|e| FitError::Solve(e.to_string()))?;
    let coefficients = (&pinv * rhs).iter().copied().collect();

    // Non-finite sample variances contribute nothing.
    let covariance = variance.map(|var| {
        let weighted = DMatrix::from_fn(pinv.nrows(), pinv.ncols(), |r, c| {
            let v = var[c];
            pinv[(r, c)] * if v.is_finite() { v } else { 0.0 }
        });
        &weighted * pinv.transpose()
    });

    Ok(LeastSquares {
        coefficients,
        covariance,
    })
}

/// Fit a polynomial of the given order by least squares.
///
/// # Arguments
///
/// * `x` - Sample abscissae
/// * `y` - Sample values, same length as `x`
/// * `order` - Polynomial order k; at least k + 1 samples are required
///
/// # Returns
///
/// The fitted [`Polynomial`], evaluable anywhere (including outside the
/// sampled range, by extrapolation).
///
/// # Errors
///
/// * [`FitError::LengthMismatch`] if `x` and `y` differ in length
/// * [`FitError::Underdetermined`] if fewer than k + 1 samples are given
pub fn polyfit(x: &[f64], y: &[f64], order: usize) -> Result<Polynomial, FitError> {
    fit_polynomial(x, y, None, order)
}

/// Fit a polynomial and propagate per-sample variances into the model.
///
/// Same as [`polyfit`]; the returned polynomial also answers
/// [`Polynomial::eval_variance`].
///
/// # Errors
///
/// As [`polyfit`], plus [`FitError::LengthMismatch`] if `variance` differs
/// in length from `x`.
pub fn polyfit_with_variance(
    x: &[f64],
    y: &[f64],
    variance: &[f64],
    order: usize,
) -> Result<Polynomial, FitError> {
    fit_polynomial(x, y, Some(variance), order)
}

fn fit_polynomial(
    x: &[f64],
    y: &[f64],
    variance: Option<&[f64]>,
    order: usize,
) -> Result<Polynomial, FitError> {
    if x.len() != y.len() || variance.is_some_and(|v| v.len() != x.len()) {
        return Err(FitError::LengthMismatch(format!(
            "x has {} samples, y has {}, variance has {}",
            x.len(),
            y.len(),
            variance.map_or(x.len(), <[f64]>::len)
        )));
    }

    let n_coeff = order + 1;
    if x.len() < n_coeff {
        return Err(FitError::Underdetermined {
            samples: x.len(),
            coefficients: n_coeff,
        });
    }

    let norm = Normalization::from_samples(x);
    let design = DMatrix::from_fn(x.len(), n_coeff, |row, col| {
        norm.apply(x[row]).powi(col as i32)
    });
    let rhs = DVector::from_column_slice(y);

    let fit = solve_least_squares(design, rhs, variance)?;
    Ok(Polynomial {
        coefficients: fit.coefficients,
        covariance: fit.covariance,
        norm,
    })
}

/// Fit a 2D polynomial surface of total degree `degree` by least squares.
///
/// Requires at least `(degree + 1)(degree + 2) / 2` samples.
pub fn polyfit2d(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    degree: usize,
) -> Result<PolynomialSurface, FitError> {
    fit_surface(x, y, z, None, degree)
}

/// Fit a 2D surface and propagate per-sample variances into the model.
pub fn polyfit2d_with_variance(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    variance: &[f64],
    degree: usize,
) -> Result<PolynomialSurface, FitError> {
    fit_surface(x, y, z, Some(variance), degree)
}

fn fit_surface(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    variance: Option<&[f64]>,
    degree: usize,
) -> Result<PolynomialSurface, FitError> {
    if x.len() != y.len()
        || x.len() != z.len()
        || variance.is_some_and(|v| v.len() != x.len())
    {
        return Err(FitError::LengthMismatch(format!(
            "x, y, z have {}, {}, {} samples",
            x.len(),
            y.len(),
            z.len()
        )));
    }

    let n_coeff = surface_coefficient_count(degree);
    if x.len() < n_coeff {
        return Err(FitError::Underdetermined {
            samples: x.len(),
            coefficients: n_coeff,
        });
    }

    let norm_x = Normalization::from_samples(x);
    let norm_y = Normalization::from_samples(y);
    let terms: Vec<(usize, usize)> = surface_terms(degree).collect();

    let design = DMatrix::from_fn(x.len(), n_coeff, |row, col| {
        let (i, j) = terms[col];
        norm_x.apply(x[row]).powi(i as i32) * norm_y.apply(y[row]).powi(j as i32)
    });
    let rhs = DVector::from_column_slice(z);

    let fit = solve_least_squares(design, rhs, variance)?;
    Ok(PolynomialSurface {
        degree,
        coefficients: fit.coefficients,
        covariance: fit.covariance,
        norm_x,
        norm_y,
    })
}
