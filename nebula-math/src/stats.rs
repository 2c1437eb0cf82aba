//! Robust statistics over flat sample slices.
//!
//! Every function ignores NaN samples. Infinite samples are kept by
//! [`median`] (they sort to the ends) but rejected by the moment-based
//! functions, which would otherwise return non-finite results.

use thiserror::Error;

/// Errors from statistical computations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    /// No usable samples remained after filtering.
    #[error("insufficient data: {total} values supplied, none usable")]
    Empty {
        /// Number of values originally supplied.
        total: usize,
    },
}

/// Calculate median of a slice of f64 values
///
/// This function computes the median while filtering out NaN values but including
/// infinite values (±inf). For even-length data, returns the average of the two
/// middle values.
///
/// # Arguments
///
/// * `values` - Slice of f64 values to compute median from
///
/// # Returns
///
/// * `Ok(median)` - The median value
/// * `Err(StatsError::Empty)` - If no non-NaN values are present
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid_values: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();

    if valid_values.is_empty() {
        return Err(StatsError::Empty {
            total: values.len(),
        });
    }

    valid_values.sort_by(f64::total_cmp);

    let mid = valid_values.len() / 2;
    let median_value = if valid_values.len() % 2 == 0 {
        (valid_values[mid - 1] + valid_values[mid]) / 2.0
    } else {
        valid_values[mid]
    };

    Ok(median_value)
}

/// Arithmetic mean of the finite values.
pub fn mean(values: &[f64]) -> Result<f64, StatsError> {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));

    if count == 0 {
        return Err(StatsError::Empty {
            total: values.len(),
        });
    }

    Ok(sum / count as f64)
}

/// Population standard deviation (ddof = 0) of the finite values.
pub fn std_dev(values: &[f64]) -> Result<f64, StatsError> {
    let mu = mean(values)?;
    let (sum_sq, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), &v| (s + (v - mu).powi(2), n + 1));

    Ok((sum_sq / count as f64).sqrt())
}

/// Iterative sigma clipping.
///
/// Repeatedly discards samples outside `[mean - low·σ, mean + high·σ]`
/// until no further samples are removed or `max_iterations` passes have
/// run. Non-finite samples are dropped up front.
///
/// # Arguments
///
/// * `values` - Samples to clip
/// * `low` - Lower rejection bound in units of σ
/// * `high` - Upper rejection bound in units of σ
/// * `max_iterations` - Upper bound on clipping passes
///
/// # Returns
///
/// The surviving samples, in their original order.
pub fn sigma_clip(values: &[f64], low: f64, high: f64, max_iterations: usize) -> Vec<f64> {
    let mut kept: Vec<f64> = values.iter().filter(|v| v.is_finite()).copied().collect();

    for _ in 0..max_iterations {
        let (Ok(mu), Ok(sigma)) = (mean(&kept), std_dev(&kept)) else {
            break;
        };

        let lower = mu - low * sigma;
        let upper = mu + high * sigma;
        let before = kept.len();
        kept.retain(|&v| v >= lower && v <= upper);

        if kept.len() == before {
            break;
        }
    }

    kept
}

/// Median of the 3σ-clipped samples.
///
/// Used throughout the extraction engine to estimate local background
/// levels in the presence of bright sources.
pub fn clipped_median(values: &[f64]) -> Result<f64, StatsError> {
    let clipped = sigma_clip(values, 3.0, 3.0, 10);
    median(&clipped).map_err(|_| StatsError::Empty {
        total: values.len(),
    })
}

/// Large-sample variance of the median of independent samples with the
/// given variances: `(π/2) Σσ² / n²`.
///
/// Non-finite variances are skipped.
pub fn median_variance(variances: &[f64]) -> Result<f64, StatsError> {
    let finite: Vec<f64> = variances.iter().filter(|v| v.is_finite()).copied().collect();
    if finite.is_empty() {
        return Err(StatsError::Empty {
            total: variances.len(),
        });
    }
    let n = finite.len() as f64;
    Ok(std::f64::consts::FRAC_PI_2 * finite.iter().sum::<f64>() / (n * n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd_and_even() {
        assert_relative_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_relative_eq!(median(&[4.0, 1.0, 2.0, 3.0]).unwrap(), 2.5);
    }

    #[test]
    fn test_median_ignores_nan() {
        let values = [f64::NAN, 5.0, 1.0, f64::NAN, 3.0];
        assert_relative_eq!(median(&values).unwrap(), 3.0);
    }

    #[test]
    fn test_median_all_nan_is_error() {
        let err = median(&[f64::NAN, f64::NAN]).unwrap_err();
        assert_eq!(err, StatsError::Empty { total: 2 });
    }

    #[test]
    fn test_mean_and_std() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(mean(&values).unwrap(), 5.0);
        assert_relative_eq!(std_dev(&values).unwrap(), 2.0);
    }

    #[test]
    fn test_sigma_clip_rejects_outlier() {
        let mut values = vec![10.0; 50];
        for (i, v) in values.iter_mut().enumerate() {
            *v += (i % 5) as f64 * 0.1;
        }
        values.push(1000.0);

        let clipped = sigma_clip(&values, 3.0, 3.0, 10);
        assert_eq!(clipped.len(), 50);
        assert!(clipped.iter().all(|&v| v < 11.0));
    }

    #[test]
    fn test_clipped_median_robust_to_bright_tail() {
        let mut values = vec![5.0; 80];
        values.extend((0..20).map(|i| 50.0 + i as f64));
        assert_relative_eq!(clipped_median(&values).unwrap(), 5.0);
    }

    #[test]
    fn test_median_variance() {
        let v = median_variance(&[2.0, 2.0, f64::NAN, 2.0, 2.0]).unwrap();
        assert_relative_eq!(v, std::f64::consts::FRAC_PI_2 * 0.5, epsilon = 1e-12);
        assert!(median_variance(&[f64::INFINITY]).is_err());
    }
}
