//! Boolean and integer-label masks over cubes.
//!
//! Boolean masks mark voxels to *include*: `false` means excluded unless
//! an operation documents otherwise. Label volumes carry 0 for background
//! and positive object identifiers.
//!
//! # Module Organization
//!
//! - **region**: rasterization of circle/box/ellipse region primitives
//!   into 2D spatial masks

pub mod region;

pub use region::{region_to_mask, RegionShape, RegionSource, RegionUnits};

use ndarray::{Array, ArrayView, ArrayView2, ArrayView3, Dimension, Ix3, Zip};

use crate::error::ExtractError;

/// Borrowed mask accepted by cube operations.
///
/// A spatial mask applies identically to every wavelength layer.
#[derive(Debug, Clone, Copy)]
pub enum VoxelMask<'a> {
    /// `(ny, nx)` mask broadcast over wavelength.
    Spatial(ArrayView2<'a, bool>),
    /// Full `(nz, ny, nx)` mask.
    Volume(ArrayView3<'a, bool>),
}

impl<'a> VoxelMask<'a> {
    /// View the mask as a volume of the given shape.
    ///
    /// # Errors
    /// [`ExtractError::DataShape`] when the mask cannot broadcast to `shape`.
    pub fn as_volume(
        &self,
        shape: (usize, usize, usize),
    ) -> Result<ArrayView3<'_, bool>, ExtractError> {
        let (nz, ny, nx) = shape;
        match self {
            VoxelMask::Spatial(m) => m.broadcast((nz, ny, nx)).ok_or_else(|| {
                ExtractError::shape("spatial mask", &[ny, nx], m.shape())
            }),
            VoxelMask::Volume(m) => {
                if m.dim() != shape {
                    return Err(ExtractError::shape("volume mask", &[nz, ny, nx], m.shape()));
                }
                Ok(m.view())
            }
        }
    }
}

/// Replace voxels where `mask` is false by `fill`.
///
/// The mask must broadcast to the data shape; a 2D `(ny, nx)` mask applied
/// to a `(nz, ny, nx)` cube masks every layer identically. The input is
/// left untouched.
///
/// # Arguments
/// * `data` - Input array
/// * `mask` - Inclusion mask (true = keep)
/// * `fill` - Replacement value, usually `f64::NAN`
///
/// # Errors
/// [`ExtractError::DataShape`] if the mask does not broadcast.
pub fn apply_mask<D, E>(
    data: &ArrayView<f64, D>,
    mask: &ArrayView<bool, E>,
    fill: f64,
) -> Result<Array<f64, D>, ExtractError>
where
    D: Dimension,
    E: Dimension,
{
    let broadcast = mask
        .broadcast(data.raw_dim())
        .ok_or_else(|| ExtractError::shape("mask", data.shape(), mask.shape()))?;

    Ok(Zip::from(data)
        .and(&broadcast)
        .map_collect(|&v, &keep| if keep { v } else { fill }))
}

/// Keep only voxels whose label equals `id`, replacing the rest by `fill`.
pub fn apply_label_mask<D, E>(
    data: &ArrayView<f64, D>,
    labels: &ArrayView<u32, E>,
    id: u32,
    fill: f64,
) -> Result<Array<f64, D>, ExtractError>
where
    D: Dimension,
    E: Dimension,
{
    let selected = labels.map(|&l| l == id);
    apply_mask(data, &selected.view(), fill)
}

/// Boolean mask of the voxels carrying label `id`.
///
/// # Errors
/// [`ExtractError::InvalidLabel`] if `id` is 0 (background) or does not
/// occur anywhere in the volume.
pub fn label_to_binary<D: Dimension>(
    labels: &ArrayView<u32, D>,
    id: u32,
) -> Result<Array<bool, D>, ExtractError> {
    if id == 0 || !labels.iter().any(|&l| l == id) {
        return Err(ExtractError::InvalidLabel(id));
    }
    Ok(labels.map(|&l| l == id))
}

/// Combine optional include/exclude masks into one candidate mask.
///
/// A voxel is a candidate when it is included (or no include mask was
/// given) and not excluded.
pub fn combine_masks(
    shape: (usize, usize, usize),
    include: Option<VoxelMask<'_>>,
    exclude: Option<VoxelMask<'_>>,
) -> Result<Array<bool, Ix3>, ExtractError> {
    let mut combined = Array::from_elem(shape, true);
    if let Some(inc) = include {
        combined.zip_mut_with(&inc.as_volume(shape)?, |c, &i| *c &= i);
    }
    if let Some(exc) = exclude {
        combined.zip_mut_with(&exc.as_volume(shape)?, |c, &e| *c &= !e);
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Array3};

    fn synthetic_labels() -> Array3<u32> {
        let mut labels = Array3::zeros((3, 4, 4));
        labels[[0, 1, 1]] = 1;
        labels[[1, 1, 1]] = 1;
        labels[[1, 1, 2]] = 1;
        labels[[2, 3, 3]] = 2;
        labels[[0, 3, 0]] = 3;
        labels
    }

    #[test]
    fn test_apply_mask_replaces_excluded() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let mask = array![[true, false], [false, true]];
        let out = apply_mask(&data.view(), &mask.view(), 0.0).unwrap();
        assert_eq!(out, array![[1.0, 0.0], [0.0, 4.0]]);
        // Input untouched.
        assert_eq!(data[[0, 1]], 2.0);
    }

    #[test]
    fn test_apply_mask_default_fill_is_nan() {
        let data = array![1.0, 2.0];
        let mask = array![false, true];
        let out = apply_mask(&data.view(), &mask.view(), f64::NAN).unwrap();
        assert!(out[0].is_nan());
        assert_eq!(out[1], 2.0);
    }

    #[test]
    fn test_apply_spatial_mask_broadcasts_over_wavelength() {
        let data = Array3::from_elem((4, 2, 3), 5.0);
        let mut mask = Array2::from_elem((2, 3), true);
        mask[[1, 2]] = false;

        let out = apply_mask(&data.view(), &mask.view(), -1.0).unwrap();
        for z in 0..4 {
            assert_eq!(out[[z, 1, 2]], -1.0);
            assert_eq!(out[[z, 0, 0]], 5.0);
        }
    }

    #[test]
    fn test_apply_mask_shape_mismatch() {
        let data = Array3::<f64>::zeros((2, 3, 4));
        let mask = Array2::from_elem((4, 3), true);
        assert!(matches!(
            apply_mask(&data.view(), &mask.view(), 0.0),
            Err(ExtractError::DataShape { what: "mask", .. })
        ));
    }

    #[test]
    fn test_label_to_binary_then_apply_mask_recovers_voxels() {
        let labels = synthetic_labels();
        let data = Array3::from_shape_fn((3, 4, 4), |(z, y, x)| (z * 16 + y * 4 + x) as f64 + 1.0);

        let mask = label_to_binary(&labels.view(), 1).unwrap();
        let masked = apply_mask(&data.view(), &mask.view(), f64::NAN).unwrap();

        for ((idx, &label), &value) in labels.indexed_iter().zip(masked.iter()) {
            if label == 1 {
                assert_eq!(value, data[idx]);
            } else {
                assert!(value.is_nan());
            }
        }
        assert_eq!(masked.iter().filter(|v| !v.is_nan()).count(), 3);
    }

    #[test]
    fn test_label_to_binary_rejects_background_label() {
        let labels = synthetic_labels();
        assert_eq!(
            label_to_binary(&labels.view(), 0).unwrap_err(),
            ExtractError::InvalidLabel(0)
        );
    }

    #[test]
    fn test_label_to_binary_rejects_absent_label() {
        let labels = synthetic_labels();
        assert_eq!(
            label_to_binary(&labels.view(), 7).unwrap_err(),
            ExtractError::InvalidLabel(7)
        );
    }

    #[test]
    fn test_apply_label_mask_selects_single_object() {
        let labels = synthetic_labels();
        let data = Array3::from_elem((3, 4, 4), 2.0);
        let out = apply_label_mask(&data.view(), &labels.view(), 2, 0.0).unwrap();
        assert_eq!(out.sum(), 2.0);
    }

    #[test]
    fn test_combine_masks() {
        let include = Array2::from_elem((2, 2), true);
        let mut exclude = Array3::from_elem((2, 2, 2), false);
        exclude[[1, 0, 0]] = true;

        let combined = combine_masks(
            (2, 2, 2),
            Some(VoxelMask::Spatial(include.view())),
            Some(VoxelMask::Volume(exclude.view())),
        )
        .unwrap();
        assert!(!combined[[1, 0, 0]]);
        assert_eq!(combined.iter().filter(|&&c| c).count(), 7);
    }

    #[test]
    fn test_volume_mask_shape_checked() {
        let m = Array3::from_elem((2, 2, 3), true);
        assert!(VoxelMask::Volume(m.view()).as_volume((2, 2, 2)).is_err());
    }
}
