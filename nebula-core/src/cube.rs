//! Data and variance cube container.
//!
//! Cubes are indexed `(wavelength, y, x)`. The variance cube, when
//! present, always shares the data shape and is co-transformed by every
//! operation that modifies flux.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis};

use crate::error::ExtractError;

/// A flux cube with its optional per-voxel variance.
#[derive(Debug, Clone, PartialEq)]
pub struct DataCube {
    /// Flux samples indexed `(z, y, x)`.
    pub data: Array3<f64>,
    /// Noise variance per voxel, same shape as `data`.
    pub variance: Option<Array3<f64>>,
}

impl DataCube {
    /// Pair a data cube with an optional variance cube.
    ///
    /// # Errors
    /// * [`ExtractError::DataShape`] if the variance shape differs
    /// * [`ExtractError::InvalidVariance`] if any finite variance is negative
    pub fn new(data: Array3<f64>, variance: Option<Array3<f64>>) -> Result<Self, ExtractError> {
        if let Some(var) = &variance {
            check_shape("variance", data.shape(), var.shape())?;
            check_variance(&var.view())?;
        }
        Ok(Self { data, variance })
    }

    /// Data cube without variance.
    pub fn without_variance(data: Array3<f64>) -> Self {
        Self {
            data,
            variance: None,
        }
    }

    /// Shape as `(nz, ny, nx)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Spatial shape as `(ny, nx)`.
    pub fn spatial_dim(&self) -> (usize, usize) {
        let (_, ny, nx) = self.data.dim();
        (ny, nx)
    }
}

/// Fail with [`ExtractError::DataShape`] unless `found == expected`.
pub(crate) fn check_shape(
    what: &'static str,
    expected: &[usize],
    found: &[usize],
) -> Result<(), ExtractError> {
    if expected != found {
        return Err(ExtractError::shape(what, expected, found));
    }
    Ok(())
}

fn check_variance(var: &ArrayView3<f64>) -> Result<(), ExtractError> {
    for ((z, y, x), &v) in var.indexed_iter() {
        if v < 0.0 {
            return Err(ExtractError::InvalidVariance {
                value: v,
                index: (z, y, x),
            });
        }
    }
    Ok(())
}

/// Layers within `half_width` of `center` that are enabled in `usable`.
///
/// A `half_width` of `None` selects every usable layer. When the window
/// holds fewer usable layers than its nominal size (because of excluded
/// wavelength ranges), it grows symmetrically until it does or until no
/// more usable layers exist.
pub fn window_layers(
    usable: &ArrayView1<bool>,
    center: usize,
    half_width: Option<usize>,
) -> Array1<bool> {
    let n = usable.len();
    let total_usable = usable.iter().filter(|&&u| u).count();

    let Some(half) = half_width else {
        return usable.to_owned();
    };

    let wanted = (2 * half + 1).min(total_usable);
    let mut reach = half;
    loop {
        let selected = Array1::from_shape_fn(n, |i| usable[i] && i.abs_diff(center) <= reach);
        let count = selected.iter().filter(|&&s| s).count();
        if count >= wanted || reach >= n {
            return selected;
        }
        reach += 1;
    }
}

/// Sum the selected layers into a 2D white-light image.
///
/// Non-finite voxels contribute nothing. The returned variance image (when
/// a variance cube is given) is the sum of the selected variances.
pub fn white_light(
    data: &ArrayView3<f64>,
    variance: Option<&ArrayView3<f64>>,
    layers: &ArrayView1<bool>,
) -> (Array2<f64>, Option<Array2<f64>>) {
    let (_, ny, nx) = data.dim();
    let mut image = Array2::zeros((ny, nx));
    let mut var_image = variance.map(|_| Array2::zeros((ny, nx)));

    for (z, layer) in data.axis_iter(Axis(0)).enumerate() {
        if !layers[z] {
            continue;
        }
        image.zip_mut_with(&layer, |acc, &v| {
            if v.is_finite() {
                *acc += v;
            }
        });
        if let (Some(var), Some(acc)) = (variance, var_image.as_mut()) {
            acc.zip_mut_with(&var.index_axis(Axis(0), z), |a, &v| {
                if v.is_finite() {
                    *a += v;
                }
            });
        }
    }

    (image, var_image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_new_rejects_mismatched_variance() {
        let data = Array3::zeros((2, 3, 4));
        let var = Array3::zeros((2, 3, 5));
        assert!(matches!(
            DataCube::new(data, Some(var)),
            Err(ExtractError::DataShape {
                what: "variance",
                ..
            })
        ));
    }

    #[test]
    fn test_new_rejects_negative_variance() {
        let data = Array3::zeros((2, 2, 2));
        let mut var = Array3::ones((2, 2, 2));
        var[[1, 0, 1]] = -0.5;
        assert_eq!(
            DataCube::new(data, Some(var)).unwrap_err(),
            ExtractError::InvalidVariance {
                value: -0.5,
                index: (1, 0, 1)
            }
        );
    }

    #[test]
    fn test_window_layers_grows_past_excluded_layers() {
        let usable = array![true, true, false, false, true, true, true];
        let selected = window_layers(&usable.view(), 3, Some(1));
        // Nominal window {2, 3, 4} has one usable layer; it grows to three.
        assert_eq!(selected.iter().filter(|&&s| s).count(), 3);
        assert!(selected[1] && selected[4] && selected[5]);
        assert!(!selected[2] && !selected[3]);
    }

    #[test]
    fn test_window_layers_full_cube() {
        let usable = array![true, false, true];
        assert_eq!(window_layers(&usable.view(), 0, None), usable);
    }

    #[test]
    fn test_white_light_sums_selected_layers() {
        let mut data = Array3::from_elem((3, 2, 2), 1.0);
        data[[1, 0, 0]] = f64::NAN;
        let var = Array3::from_elem((3, 2, 2), 0.5);
        let layers = array![true, true, false];

        let (img, var_img) = white_light(&data.view(), Some(&var.view()), &layers.view());
        assert_relative_eq!(img[[0, 0]], 1.0);
        assert_relative_eq!(img[[1, 1]], 2.0);
        assert_relative_eq!(var_img.unwrap()[[1, 1]], 1.0);
    }
}
