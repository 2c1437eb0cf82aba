//! Automatic point-source detection on white-light images.

use ndarray::{Array2, ArrayView2};
use nebula_math::{clipped_median, sigma_clip, std_dev};
use serde::Serialize;

/// A detected peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    /// Peak pixel `(x, y)`.
    pub position: (f64, f64),
    /// Background-subtracted peak value.
    pub peak: f64,
    /// Detection SNR of the peak pixel.
    pub snr: f64,
}

/// Per-pixel SNR of a background-subtracted image.
///
/// Uses the per-pixel variance image when given, otherwise the standard
/// deviation of the 3-sigma clipped pixel values. Pixels with zero or
/// non-finite noise get SNR 0.
fn snr_image(image: &Array2<f64>, variance: Option<&ArrayView2<f64>>) -> Array2<f64> {
    match variance {
        Some(var) => Array2::from_shape_fn(image.dim(), |idx| {
            let v = var[idx];
            if v > 0.0 && v.is_finite() && image[idx].is_finite() {
                image[idx] / v.sqrt()
            } else {
                0.0
            }
        }),
        None => {
            let values: Vec<f64> = image.iter().copied().collect();
            let sigma = std_dev(&sigma_clip(&values, 3.0, 3.0, 10)).unwrap_or(0.0);
            image.mapv(|v| {
                if sigma > 0.0 && v.is_finite() {
                    v / sigma
                } else {
                    0.0
                }
            })
        }
    }
}

/// True when `(y, x)` is an 8-neighbour local maximum.
///
/// Plateaus resolve to their first pixel in raster order: earlier
/// neighbours must be strictly lower, later ones not higher.
fn is_local_max(snr: &Array2<f64>, y: usize, x: usize) -> bool {
    let (ny, nx) = snr.dim();
    let value = snr[[y, x]];

    for dy in -1isize..=1 {
        for dx in -1isize..=1 {
            if dy == 0 && dx == 0 {
                continue;
            }
            let (ny_i, nx_i) = (y as isize + dy, x as isize + dx);
            if ny_i < 0 || nx_i < 0 || ny_i >= ny as isize || nx_i >= nx as isize {
                continue;
            }
            let neighbour = snr[[ny_i as usize, nx_i as usize]];
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if (earlier && neighbour >= value) || (!earlier && neighbour > value) {
                return false;
            }
        }
    }
    true
}

/// Find point sources above an SNR threshold.
///
/// # Arguments
/// * `image` - White-light image
/// * `variance` - Optional white-light variance image
/// * `threshold` - Minimum detection SNR
/// * `min_separation` - Peaks within this distance of a stronger accepted
///   peak are suppressed (normally `r_sub`)
///
/// # Returns
/// Detections sorted by SNR, highest first.
pub fn detect_sources(
    image: &ArrayView2<f64>,
    variance: Option<&ArrayView2<f64>>,
    threshold: f64,
    min_separation: f64,
) -> Vec<Detection> {
    let values: Vec<f64> = image.iter().copied().collect();
    let background = clipped_median(&values).unwrap_or(0.0);
    let subtracted = image.mapv(|v| v - background);
    let snr = snr_image(&subtracted, variance);

    let mut candidates: Vec<Detection> = snr
        .indexed_iter()
        .filter(|&(_, &s)| s >= threshold)
        .filter(|&((y, x), _)| is_local_max(&snr, y, x))
        .map(|((y, x), &s)| Detection {
            position: (x as f64, y as f64),
            peak: subtracted[[y, x]],
            snr: s,
        })
        .collect();

    candidates.sort_by(|a, b| b.snr.total_cmp(&a.snr));

    let mut accepted: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let (cx, cy) = candidate.position;
        let suppressed = accepted
            .iter()
            .any(|a| (a.position.0 - cx).hypot(a.position.1 - cy) <= min_separation);
        if !suppressed {
            accepted.push(candidate);
        }
    }

    log::debug!(
        "Detected {} sources above SNR {:.1} (background {:.4})",
        accepted.len(),
        threshold,
        background
    );
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_helpers::gaussian_2d;

    fn field(sources: &[((f64, f64), f64)]) -> Array2<f64> {
        Array2::from_shape_fn((30, 30), |(y, x)| {
            sources
                .iter()
                .map(|&(c, a)| gaussian_2d(x as f64, y as f64, c, a, 1.2))
                .sum()
        })
    }

    #[test]
    fn test_detects_sorted_by_snr() {
        let image = field(&[((8.0, 8.0), 20.0), ((22.0, 20.0), 60.0)]);
        let variance = Array2::from_elem((30, 30), 1.0);

        let found = detect_sources(&image.view(), Some(&variance.view()), 5.0, 4.0);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].position, (22.0, 20.0));
        assert_eq!(found[1].position, (8.0, 8.0));
        assert_relative_eq!(found[0].snr, 60.0, epsilon = 1e-6);
    }

    #[test]
    fn test_threshold_excludes_faint_peaks() {
        let image = field(&[((8.0, 8.0), 3.0), ((22.0, 20.0), 60.0)]);
        let variance = Array2::from_elem((30, 30), 1.0);

        let found = detect_sources(&image.view(), Some(&variance.view()), 5.0, 4.0);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_non_maximum_suppression() {
        let image = field(&[((10.0, 10.0), 50.0), ((14.0, 10.0), 30.0)]);
        let variance = Array2::from_elem((30, 30), 1.0);

        let all = detect_sources(&image.view(), Some(&variance.view()), 5.0, 3.0);
        assert_eq!(all.len(), 2);

        let suppressed = detect_sources(&image.view(), Some(&variance.view()), 5.0, 5.0);
        assert_eq!(suppressed.len(), 1);
        assert_eq!(suppressed[0].position, (10.0, 10.0));
    }

    #[test]
    fn test_plateau_yields_single_peak() {
        let mut image = Array2::zeros((10, 10));
        image[[4, 4]] = 10.0;
        image[[4, 5]] = 10.0;
        let variance = Array2::from_elem((10, 10), 1.0);

        let found = detect_sources(&image.view(), Some(&variance.view()), 5.0, 0.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].position, (4.0, 4.0));
    }

    #[test]
    fn test_noise_estimate_without_variance() {
        let mut image = field(&[((15.0, 15.0), 40.0)]);
        // Alternating +-1 background gives a clipped std of about 1.
        for ((y, x), v) in image.indexed_iter_mut() {
            *v += if (x + y) % 2 == 0 { 1.0 } else { -1.0 };
        }

        let found = detect_sources(&image.view(), None, 10.0, 3.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].position, (15.0, 15.0));
    }
}
