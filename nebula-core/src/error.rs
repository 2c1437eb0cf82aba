//! Error taxonomy and recoverable diagnostics.
//!
//! Shape and configuration problems are preconditions: they are checked
//! before any computation starts and surface as [`ExtractError`]. Numerical
//! trouble confined to one unit of work (a spectrum that cannot support its
//! polynomial, a source whose fit aperture is empty, a recentering loop
//! that hits its cap) never aborts the batch; it becomes a [`Diagnostic`]
//! returned next to the primary result.

use std::fmt;

use nebula_math::OptimizeError;
use serde::Serialize;
use thiserror::Error;

/// Fatal errors raised by the extraction engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    /// Invalid or missing configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An auxiliary array does not match the data volume.
    #[error("shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    DataShape {
        /// Name of the offending array.
        what: &'static str,
        /// Shape required by the operation.
        expected: Vec<usize>,
        /// Shape actually supplied.
        found: Vec<usize>,
    },

    /// Variance cube holds a negative value.
    #[error("variance must be non-negative, found {value} at {index:?}")]
    InvalidVariance {
        /// Offending value.
        value: f64,
        /// Voxel index `(z, y, x)`.
        index: (usize, usize, usize),
    },

    /// Label 0 or a label absent from the volume was requested.
    #[error("label {0} is not an object label in this volume")]
    InvalidLabel(u32),

    /// The operation as a whole has too little data to proceed.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// The optimizer rejected its inputs.
    #[error("optimizer failed: {0}")]
    Optimizer(#[from] OptimizeError),
}

impl ExtractError {
    pub(crate) fn shape(what: &'static str, expected: &[usize], found: &[usize]) -> Self {
        Self::DataShape {
            what,
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

/// Recoverable condition recorded while processing one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Diagnostic {
    /// A slice or aperture had too few usable samples; its model was set
    /// to zero.
    InsufficientData {
        /// Human-readable unit identifier, e.g. `"spaxel (y=3, x=4)"`.
        unit: String,
        /// Usable samples found.
        available: usize,
        /// Samples the model needs.
        required: usize,
    },

    /// Recentering hit its iteration cap before the shift dropped below
    /// tolerance. The last fit was used.
    RecenterNotConverged {
        /// Source index in subtraction order.
        source: usize,
        /// Iterations executed.
        iterations: usize,
        /// Center shift (pixels) of the final iteration.
        last_shift: f64,
    },

    /// A fitted parameter sits on its optimizer bound.
    FitAtBound {
        /// Source index in subtraction order.
        source: usize,
        /// Parameter name.
        parameter: &'static str,
        /// Fitted value.
        value: f64,
    },

    /// A point source was skipped entirely.
    SourceSkipped {
        /// Source index in subtraction order.
        source: usize,
        /// Nominal `(x, y)` position.
        position: (f64, f64),
        /// Why the source was skipped.
        reason: String,
    },

    /// Adaptive smoothing left voxels below the target SNR at maximum scale.
    LowConfidence {
        /// Number of flagged voxels.
        voxels: usize,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::InsufficientData {
                unit,
                available,
                required,
            } => write!(
                f,
                "insufficient data in {unit}: {available} usable samples, {required} required; model set to zero"
            ),
            Diagnostic::RecenterNotConverged {
                source,
                iterations,
                last_shift,
            } => write!(
                f,
                "source {source}: recentering did not converge after {iterations} iterations (last shift {last_shift:.4} px)"
            ),
            Diagnostic::FitAtBound {
                source,
                parameter,
                value,
            } => write!(
                f,
                "source {source}: fitted {parameter}={value:.4} lies on its bound"
            ),
            Diagnostic::SourceSkipped {
                source,
                position,
                reason,
            } => write!(
                f,
                "source {source} at ({:.2}, {:.2}) skipped: {reason}",
                position.0, position.1
            ),
            Diagnostic::LowConfidence { voxels } => write!(
                f,
                "{voxels} voxels did not reach the target SNR at maximum kernel size"
            ),
        }
    }
}

/// Ordered list of recoverable conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a condition and log it at warn level.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        log::warn!("{diagnostic}");
        self.0.push(diagnostic);
    }

    /// Append every entry of `other`, preserving order. Entries were already
    /// logged when first recorded.
    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    /// Number of recorded conditions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over recorded conditions.
    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
