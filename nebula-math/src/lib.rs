//! nebula-math - Numerical building blocks for IFU cube processing
//!
//! This crate provides the numerical algorithms used by the extraction
//! engine that carry no knowledge of cubes, masks or headers:
//!
//! - **Statistics** - NaN-aware median, mean, standard deviation and
//!   iterative sigma clipping, and the sampling variance of a median
//! - **Polynomial fitting** - least-squares 1D polynomials and 2D
//!   polynomial surfaces solved through SVD, with optional propagation of
//!   sample variances into the model
//! - **Optimization** - the [`Optimizer`] capability (bounded global
//!   minimization) and a seeded differential-evolution implementation
//!
//! # Example
//!
//! ```text
//! use nebula_math::{DifferentialEvolution, Optimizer};
//!
//! let de = DifferentialEvolution::default();
//! let objective = |p: &[f64]| (p[0] - 1.5).powi(2);
//! let best = de.minimize(&objective, &[(-5.0, 5.0)], 42)?;
//! assert!((best.params[0] - 1.5).abs() < 1e-4);
//! ```

pub mod optimize;
pub mod polyfit;
pub mod stats;

pub use optimize::{DifferentialEvolution, Minimum, OptimizeError, Optimizer};
pub use polyfit::{
    polyfit, polyfit2d, polyfit2d_with_variance, polyfit_with_variance, FitError, Polynomial,
    PolynomialSurface,
};
pub use stats::{
    clipped_median, mean, median, median_variance, sigma_clip, std_dev, StatsError,
};
