//! SNR thresholding and 3D segmentation into emission objects.
//!
//! # Module Organization
//!
//! - **labeling**: union-find connected-component labeling of a candidate
//!   volume under 6, 18 or 26 connectivity
//! - **aabb**: 3D bounding boxes of the labeled objects

pub mod aabb;
pub mod labeling;

pub use aabb::Aabb3;
pub use labeling::{connected_components_3d, remove_small_components, Connectivity};

use std::time::Instant;

use ndarray::{Array3, ArrayView3, Zip};
use serde::{Deserialize, Serialize};

use crate::cube::check_shape;
use crate::error::ExtractError;
use crate::header::WavelengthAxis;
use crate::mask::{combine_masks, VoxelMask};

/// Segmentation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Minimum voxel SNR for candidacy.
    pub snrmin: f64,
    /// Components with fewer voxels are returned to the background.
    pub min_voxels: usize,
    /// Neighbour definition for labeling.
    pub connectivity: Connectivity,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            snrmin: 3.0,
            min_voxels: 1,
            connectivity: Connectivity::TwentySix,
        }
    }
}

impl SegmentConfig {
    /// Check that `snrmin` is finite and `min_voxels` is at least 1.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if !self.snrmin.is_finite() {
            return Err(ExtractError::Configuration(format!(
                "snrmin must be finite, got {}",
                self.snrmin
            )));
        }
        if self.min_voxels == 0 {
            return Err(ExtractError::Configuration(
                "min_voxels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary of one labeled object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmissionObject {
    /// Label in the returned volume.
    pub id: u32,
    /// Flux-weighted centroid column.
    pub centroid_x: f64,
    /// Flux-weighted centroid row.
    pub centroid_y: f64,
    /// Flux-weighted centroid layer.
    pub centroid_z: f64,
    /// Wavelength of `centroid_z`, when an axis was supplied.
    pub centroid_wavelength: Option<f64>,
    /// Number of voxels.
    pub voxels: usize,
    /// Summed finite flux.
    pub flux: f64,
    /// `flux / sqrt(summed variance)`, 0 when the variance sum is 0.
    pub snr: f64,
    /// Inclusive bounding box.
    pub bbox: Aabb3,
}

/// Label volume and its object table.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// 0 for background, 1..=N for objects.
    pub labels: Array3<u32>,
    /// One entry per label, ordered by id.
    pub objects: Vec<EmissionObject>,
}

impl Segmentation {
    /// Total number of labeled voxels.
    pub fn labeled_voxels(&self) -> usize {
        self.labels.iter().filter(|&&l| l > 0).count()
    }
}

/// Per-voxel `data / sqrt(variance)`.
///
/// Zero wherever the variance is zero, negative or non-finite, or the data
/// is non-finite, so the map never holds infinities or NaN.
pub fn snr_map(data: &ArrayView3<f64>, variance: &ArrayView3<f64>) -> Array3<f64> {
    Zip::from(data).and(variance).par_map_collect(|&d, &v| {
        if d.is_finite() && v.is_finite() && v > 0.0 {
            d / v.sqrt()
        } else {
            0.0
        }
    })
}

#[derive(Default)]
struct Accumulator {
    voxels: usize,
    flux: f64,
    variance: f64,
    weighted: [f64; 3],
    geometric: [f64; 3],
    bbox: Aabb3,
}

impl Accumulator {
    fn add(&mut self, (z, y, x): (usize, usize, usize), d: f64, v: f64) {
        self.voxels += 1;
        self.bbox.expand_to_include(z, y, x);
        let coords = [z as f64, y as f64, x as f64];
        for i in 0..3 {
            self.geometric[i] += coords[i];
        }
        if d.is_finite() {
            self.flux += d;
            for i in 0..3 {
                self.weighted[i] += d * coords[i];
            }
        }
        if v.is_finite() {
            self.variance += v;
        }
    }

    fn finish(self, id: u32, axis: Option<&WavelengthAxis>) -> EmissionObject {
        let centroid: [f64; 3] = if self.flux > 0.0 {
            self.weighted.map(|w| w / self.flux)
        } else {
            self.geometric.map(|g| g / self.voxels as f64)
        };
        let snr = if self.variance > 0.0 {
            self.flux / self.variance.sqrt()
        } else {
            0.0
        };
        EmissionObject {
            id,
            centroid_x: centroid[2],
            centroid_y: centroid[1],
            centroid_z: centroid[0],
            centroid_wavelength: axis.map(|a| a.wavelength_at(centroid[0])),
            voxels: self.voxels,
            flux: self.flux,
            snr,
            bbox: self.bbox,
        }
    }
}

/// Threshold SNR and label connected emission regions.
///
/// # Arguments
/// * `data` - Residual (or smoothed) cube
/// * `variance` - Its variance
/// * `config` - Threshold, minimum size and connectivity
/// * `include` - Optional mask; voxels where it is false are never candidates
/// * `exclude` - Optional mask; voxels where it is true are never candidates
/// * `axis` - Optional wavelength axis for centroid wavelengths
///
/// # Returns
/// The label volume and one [`EmissionObject`] per surviving component.
///
/// # Errors
/// * [`ExtractError::DataShape`] if variance or a mask does not match
/// * [`ExtractError::Configuration`] for an invalid configuration
pub fn segment(
    data: &ArrayView3<f64>,
    variance: &ArrayView3<f64>,
    config: &SegmentConfig,
    include: Option<VoxelMask<'_>>,
    exclude: Option<VoxelMask<'_>>,
    axis: Option<&WavelengthAxis>,
) -> Result<Segmentation, ExtractError> {
    config.validate()?;
    check_shape("variance", data.shape(), variance.shape())?;
    let candidates_mask = combine_masks(data.dim(), include, exclude)?;
    let started = Instant::now();

    log::debug!(
        "Segmenting {:?} at SNR >= {} ({:?} connectivity, min {} voxels)",
        data.dim(),
        config.snrmin,
        config.connectivity,
        config.min_voxels
    );

    let snr = snr_map(data, variance);
    let candidates = Zip::from(&snr)
        .and(&candidates_mask)
        .map_collect(|&s, &keep| keep && s >= config.snrmin);

    let (mut labels, found) = connected_components_3d(&candidates.view(), config.connectivity);
    let kept = remove_small_components(&mut labels, found, config.min_voxels);

    let mut accumulators: Vec<Accumulator> = (0..kept).map(|_| Accumulator::default()).collect();
    for (idx, &label) in labels.indexed_iter() {
        if label > 0 {
            accumulators[label as usize - 1].add(idx, data[idx], variance[idx]);
        }
    }

    let objects: Vec<EmissionObject> = accumulators
        .into_iter()
        .enumerate()
        .map(|(i, acc)| acc.finish(i as u32 + 1, axis))
        .collect();

    log::info!(
        "Segmentation found {} objects ({} discarded below {} voxels) in {:.1} ms",
        objects.len(),
        found - kept,
        config.min_voxels,
        started.elapsed().as_secs_f64() * 1000.0
    );

    Ok(Segmentation { labels, objects })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use test_helpers::{add_gaussian_noise, inject_block, uniform_cube};

    fn unit_variance(shape: (usize, usize, usize)) -> Array3<f64> {
        uniform_cube(shape, 1.0)
    }

    #[test]
    fn test_snr_map_never_divides_by_zero() {
        let mut data = uniform_cube((1, 2, 2), 4.0);
        data[[0, 1, 1]] = f64::NAN;
        let mut var = uniform_cube((1, 2, 2), 4.0);
        var[[0, 0, 1]] = 0.0;
        var[[0, 1, 0]] = f64::INFINITY;

        let snr = snr_map(&data.view(), &var.view());
        assert_eq!(snr[[0, 0, 0]], 2.0);
        assert_eq!(snr[[0, 0, 1]], 0.0);
        assert_eq!(snr[[0, 1, 0]], 0.0);
        assert_eq!(snr[[0, 1, 1]], 0.0);
    }

    #[test]
    fn test_lowering_threshold_never_loses_voxels() {
        let shape = (6, 16, 16);
        let mut data = uniform_cube(shape, 0.0);
        add_gaussian_noise(&mut data, 1.0, 17);
        inject_block(&mut data, (2, 4), (4, 8), (4, 8), 3.0);
        let var = unit_variance(shape);

        let mut previous = 0;
        for snrmin in [6.0, 4.0, 3.0, 2.0, 1.0, 0.0, -1.0] {
            let config = SegmentConfig {
                snrmin,
                min_voxels: 3,
                ..SegmentConfig::default()
            };
            let seg = segment(&data.view(), &var.view(), &config, None, None, None).unwrap();
            let count = seg.labeled_voxels();
            assert!(
                count >= previous,
                "snrmin {snrmin}: {count} labeled voxels, fewer than {previous}"
            );
            previous = count;
        }
    }

    #[test]
    fn test_diagonal_filament_is_one_object_under_26() {
        let shape = (5, 5, 5);
        let mut data = uniform_cube(shape, 0.0);
        for i in 0..5 {
            data[[i, i, i]] = 10.0;
        }
        let var = unit_variance(shape);

        let default = segment(&data.view(), &var.view(), &SegmentConfig::default(), None, None, None).unwrap();
        assert_eq!(default.objects.len(), 1);
        assert_eq!(default.objects[0].voxels, 5);

        let faces = SegmentConfig {
            connectivity: Connectivity::Six,
            ..SegmentConfig::default()
        };
        let split = segment(&data.view(), &var.view(), &faces, None, None, None).unwrap();
        assert_eq!(split.objects.len(), 5);
    }

    #[test]
    fn test_small_components_return_to_background() {
        let shape = (4, 10, 10);
        let mut data = uniform_cube(shape, 0.0);
        data[[0, 0, 0]] = 10.0;
        inject_block(&mut data, (1, 3), (5, 7), (5, 7), 10.0);
        let config = SegmentConfig {
            min_voxels: 4,
            ..SegmentConfig::default()
        };

        let seg = segment(&data.view(), &unit_variance(shape).view(), &config, None, None, None).unwrap();
        assert_eq!(seg.objects.len(), 1);
        assert_eq!(seg.labels[[0, 0, 0]], 0);
        assert_eq!(seg.labels[[1, 5, 5]], 1);
        assert_eq!(seg.objects[0].voxels, 27);
    }

    #[test]
    fn test_object_summary() {
        let shape = (6, 8, 8);
        let mut data = uniform_cube(shape, 0.0);
        data[[2, 3, 3]] = 10.0;
        data[[3, 3, 4]] = 30.0;
        let var = uniform_cube(shape, 4.0);
        let axis = WavelengthAxis {
            start: 5000.0,
            step: 2.0,
            count: 6,
        };

        let seg = segment(
            &data.view(),
            &var.view(),
            &SegmentConfig::default(),
            None,
            None,
            Some(&axis),
        )
        .unwrap();

        assert_eq!(seg.objects.len(), 1);
        let obj = &seg.objects[0];
        assert_eq!(obj.id, 1);
        assert_eq!(obj.voxels, 2);
        assert_relative_eq!(obj.flux, 40.0);
        assert_relative_eq!(obj.centroid_z, 2.75);
        assert_relative_eq!(obj.centroid_x, 3.75);
        assert_relative_eq!(obj.centroid_y, 3.0);
        assert_relative_eq!(obj.centroid_wavelength.unwrap(), 5005.5);
        assert_relative_eq!(obj.snr, 40.0 / 8.0_f64.sqrt(), epsilon = 1e-12);
        assert_eq!(obj.bbox.dims(), (2, 1, 2));
    }

    #[test]
    fn test_include_and_exclude_masks() {
        let shape = (2, 6, 6);
        let mut data = uniform_cube(shape, 0.0);
        inject_block(&mut data, (0, 1), (0, 1), (0, 1), 10.0);
        inject_block(&mut data, (0, 1), (4, 5), (4, 5), 10.0);
        let var = unit_variance(shape);

        let mut include = Array2::from_elem((6, 6), true);
        include[[0, 0]] = false;
        include[[0, 1]] = false;
        include[[1, 0]] = false;
        include[[1, 1]] = false;
        let mut exclude = Array3::from_elem(shape, false);
        exclude[[0, 4, 4]] = true;

        let seg = segment(
            &data.view(),
            &var.view(),
            &SegmentConfig::default(),
            Some(VoxelMask::Spatial(include.view())),
            Some(VoxelMask::Volume(exclude.view())),
            None,
        )
        .unwrap();

        assert_eq!(seg.objects.len(), 1);
        assert_eq!(seg.objects[0].voxels, 7);
        assert_eq!(seg.labels[[0, 4, 4]], 0);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let data = uniform_cube((2, 3, 3), 1.0);
        let var = uniform_cube((2, 3, 4), 1.0);
        assert!(matches!(
            segment(&data.view(), &var.view(), &SegmentConfig::default(), None, None, None),
            Err(ExtractError::DataShape { what: "variance", .. })
        ));

        let mask = Array2::from_elem((4, 4), true);
        assert!(matches!(
            segment(
                &data.view(),
                &uniform_cube((2, 3, 3), 1.0).view(),
                &SegmentConfig::default(),
                Some(VoxelMask::Spatial(mask.view())),
                None,
                None
            ),
            Err(ExtractError::DataShape { .. })
        ));
    }
}
