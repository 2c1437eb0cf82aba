//! Header metadata needed for physical-to-voxel unit conversion.
//!
//! Header parsing and WCS handling belong to the caller. The engine only
//! needs the linear wavelength sampling of the spectral axis and the
//! spatial plate scale, exposed through [`CubeHeaderAdapter`].

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Linear sampling of the wavelength axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavelengthAxis {
    /// Wavelength of layer 0 (Angstrom).
    pub start: f64,
    /// Wavelength increment per layer (Angstrom).
    pub step: f64,
    /// Number of layers.
    pub count: usize,
}

impl WavelengthAxis {
    /// Wavelength at a fractional layer coordinate.
    pub fn wavelength_at(&self, layer: f64) -> f64 {
        self.start + self.step * layer
    }

    /// Fractional layer coordinate of a wavelength.
    pub fn layer_of(&self, wavelength: f64) -> f64 {
        (wavelength - self.start) / self.step
    }

    /// Wavelength of every layer.
    pub fn wavelengths(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.count, |i| self.wavelength_at(i as f64))
    }

    /// Layers usable for white-light images: false for every layer whose
    /// wavelength lies inside one of the closed `excluded` ranges.
    pub fn layer_mask(&self, excluded: &[(f64, f64)]) -> Array1<bool> {
        Array1::from_shape_fn(self.count, |i| {
            let w = self.wavelength_at(i as f64);
            !excluded
                .iter()
                .any(|&(w0, w1)| w >= w0.min(w1) && w <= w0.max(w1))
        })
    }

    /// Excluded layers as contiguous closed index runs `(first, last)`.
    pub fn excluded_runs(&self, excluded: &[(f64, f64)]) -> Vec<(usize, usize)> {
        let usable = self.layer_mask(excluded);
        let mut runs = Vec::new();
        let mut run_start = None;
        for (i, &ok) in usable.iter().enumerate() {
            match (ok, run_start) {
                (false, None) => run_start = Some(i),
                (true, Some(start)) => {
                    runs.push((start, i - 1));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            runs.push((start, self.count - 1));
        }
        runs
    }

    /// Convert a wavelength width (Angstrom) to a layer count.
    pub fn width_in_layers(&self, width: f64) -> usize {
        (width / self.step.abs()).round().max(0.0) as usize
    }
}

/// Narrow view of a cube header.
pub trait CubeHeaderAdapter {
    /// Sampling of the spectral axis.
    fn wavelength_axis(&self) -> WavelengthAxis;

    /// Spatial plate scale in arcsec per pixel.
    fn pixel_scale_arcsec(&self) -> f64;

    /// Convert an angular length (arcsec) to pixels.
    fn arcsec_to_pixels(&self, arcsec: f64) -> f64 {
        arcsec / self.pixel_scale_arcsec()
    }
}

/// Header values already extracted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearHeader {
    /// Spectral sampling.
    pub wavelength: WavelengthAxis,
    /// Spatial plate scale (arcsec/pixel).
    pub pixel_scale: f64,
}

impl CubeHeaderAdapter for LinearHeader {
    fn wavelength_axis(&self) -> WavelengthAxis {
        self.wavelength
    }

    fn pixel_scale_arcsec(&self) -> f64 {
        self.pixel_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axis() -> WavelengthAxis {
        WavelengthAxis {
            start: 4000.0,
            step: 0.5,
            count: 20,
        }
    }

    #[test]
    fn test_wavelength_roundtrip() {
        let axis = axis();
        assert_relative_eq!(axis.wavelength_at(4.0), 4002.0);
        assert_relative_eq!(axis.layer_of(4002.0), 4.0);
        assert_eq!(axis.wavelengths().len(), 20);
    }

    #[test]
    fn test_layer_mask_excludes_closed_ranges() {
        let mask = axis().layer_mask(&[(4001.0, 4002.0), (4009.5, 4009.0)]);
        assert!(mask[1]);
        assert!(!mask[2]);
        assert!(!mask[3]);
        assert!(!mask[4]);
        assert!(mask[5]);
        assert!(!mask[18]);
        assert!(!mask[19]);
        assert_eq!(mask.iter().filter(|&&m| !m).count(), 5);
    }

    #[test]
    fn test_excluded_runs() {
        let runs = axis().excluded_runs(&[(4001.0, 4002.0), (4009.5, 4009.0)]);
        assert_eq!(runs, vec![(2, 4), (18, 19)]);
        assert!(axis().excluded_runs(&[]).is_empty());
    }

    #[test]
    fn test_unit_conversion() {
        let header = LinearHeader {
            wavelength: axis(),
            pixel_scale: 0.3,
        };
        assert_relative_eq!(header.arcsec_to_pixels(1.5), 5.0);
        assert_eq!(header.wavelength_axis().width_in_layers(10.0), 20);
    }
}
