//! Circular apertures around point sources.
//!
//! All membership tests use the pixel-center rule: pixel `(y, x)` lies in
//! an aperture when `hypot(x - x0, y - y0) <= radius`.

use ndarray::{Array2, ArrayView2};
use nebula_math::clipped_median;

/// Minimum number of finite pixels outside the subtraction radius needed
/// to estimate a local background.
pub const MIN_BACKGROUND_PIXELS: usize = 5;

/// Disk of pixels around a sub-pixel center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircularAperture {
    /// Center `(x, y)` in pixels.
    pub center: (f64, f64),
    /// Radius in pixels.
    pub radius: f64,
}

impl CircularAperture {
    /// Aperture of `radius` around `center`.
    pub fn new(center: (f64, f64), radius: f64) -> Self {
        Self { center, radius }
    }

    /// Whether pixel center `(x, y)` lies inside.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let dx = x - self.center.0;
        let dy = y - self.center.1;
        dx * dx + dy * dy <= self.radius * self.radius
    }

    /// Clipped index window `(y_min..y_max, x_min..x_max)` covering the disk.
    fn window(&self, shape: (usize, usize)) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let (height, width) = shape;
        let reach = self.radius.max(0.0).ceil() as isize + 1;
        let x_int = self.center.0.round() as isize;
        let y_int = self.center.1.round() as isize;

        let x_min = (x_int - reach).clamp(0, width as isize) as usize;
        let x_max = (x_int + reach + 1).clamp(0, width as isize) as usize;
        let y_min = (y_int - reach).clamp(0, height as isize) as usize;
        let y_max = (y_int + reach + 1).clamp(0, height as isize) as usize;
        (y_min..y_max, x_min..x_max)
    }

    /// In-bounds pixel indices `(y, x)` inside the aperture, in raster order.
    pub fn pixels(&self, shape: (usize, usize)) -> Vec<(usize, usize)> {
        let (rows, cols) = self.window(shape);
        let mut pixels = Vec::new();
        for y in rows {
            for x in cols.clone() {
                if self.contains(x as f64, y as f64) {
                    pixels.push((y, x));
                }
            }
        }
        pixels
    }

    /// Boolean image of the aperture.
    pub fn mask(&self, shape: (usize, usize)) -> Array2<bool> {
        let mut mask = Array2::from_elem(shape, false);
        for (y, x) in self.pixels(shape) {
            mask[[y, x]] = true;
        }
        mask
    }
}

/// Collect finite pixel values inside an aperture and outside an exclusion
/// radius.
///
/// # Arguments
/// * `image` - 2D image
/// * `center` - Source position `(x, y)`
/// * `aperture_radius` - Radius of the source aperture
/// * `background_radius` - Pixels farther than this (anywhere in the image)
///   count as background
///
/// # Returns
/// Tuple of (aperture_pixels, background_pixels)
pub fn collect_aperture_pixels(
    image: &ArrayView2<f64>,
    center: (f64, f64),
    aperture_radius: f64,
    background_radius: f64,
) -> (Vec<f64>, Vec<f64>) {
    let inner = CircularAperture::new(center, aperture_radius);
    let outer = CircularAperture::new(center, background_radius);

    let mut aperture_pixels = Vec::new();
    let mut background_pixels = Vec::new();

    for ((y, x), &v) in image.indexed_iter() {
        if !v.is_finite() {
            continue;
        }
        let (xf, yf) = (x as f64, y as f64);
        if inner.contains(xf, yf) {
            aperture_pixels.push(v);
        }
        if !outer.contains(xf, yf) {
            background_pixels.push(v);
        }
    }

    (aperture_pixels, background_pixels)
}

/// Sigma-clipped median of the finite pixels outside `exclusion_radius`.
///
/// Returns `None` when fewer than [`MIN_BACKGROUND_PIXELS`] are available,
/// in which case no background is removed.
pub fn local_background(
    image: &ArrayView2<f64>,
    center: (f64, f64),
    exclusion_radius: f64,
) -> Option<f64> {
    let (_, background) = collect_aperture_pixels(image, center, 0.0, exclusion_radius);
    if background.len() < MIN_BACKGROUND_PIXELS {
        return None;
    }
    clipped_median(&background).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_aperture_pixels_pixel_center_rule() {
        let ap = CircularAperture::new((5.0, 5.0), 1.0);
        let pixels = ap.pixels((11, 11));
        assert_eq!(pixels.len(), 5);
        assert!(pixels.contains(&(5, 5)));
        assert!(pixels.contains(&(4, 5)));
        assert!(!pixels.contains(&(4, 4)));
    }

    #[test]
    fn test_aperture_clipped_at_edges() {
        let ap = CircularAperture::new((0.0, 0.0), 2.0);
        let mask = ap.mask((4, 4));
        assert_eq!(mask.iter().filter(|&&m| m).count(), 6);
    }

    #[test]
    fn test_collect_aperture_pixels() {
        let mut image = Array2::from_elem((21, 21), 1.0);
        image[[10, 10]] = 100.0;
        image[[0, 0]] = f64::NAN;

        let (aperture, background) = collect_aperture_pixels(&image.view(), (10.0, 10.0), 1.0, 5.0);
        assert_eq!(aperture.len(), 5);
        assert_relative_eq!(aperture.iter().sum::<f64>(), 104.0);
        // 441 pixels minus the 81 within r=5 minus the NaN corner.
        assert_eq!(background.len(), 441 - 81 - 1);
    }

    #[test]
    fn test_local_background_needs_enough_pixels() {
        let image = Array2::from_elem((5, 5), 3.0);
        assert!(local_background(&image.view(), (2.0, 2.0), 10.0).is_none());

        let image = Array2::from_elem((20, 20), 3.0);
        assert_relative_eq!(local_background(&image.view(), (10.0, 10.0), 4.0).unwrap(), 3.0);
    }
}
