//! End-to-end extraction driver.
//!
//! Runs continuum removal, optional point-source subtraction, optional
//! smoothing and segmentation in that order. Smoothing only feeds the
//! segmenter; the returned residual is the unsmoothed PSF residual.

use std::time::Instant;

use ndarray::{Array2, Array3};
use nebula_math::Optimizer;

use crate::config::PipelineConfig;
use crate::continuum::subtract_continuum;
use crate::cube::DataCube;
use crate::error::{Diagnostics, ExtractError};
use crate::header::CubeHeaderAdapter;
use crate::psf::{psf_sub_all, PsfConfig, SliceSourceModel, SourceModel};
use crate::segment::{segment, EmissionObject};
use crate::smooth::{smooth_cube, SmoothResult};

/// Everything produced by [`run_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Continuum- and source-subtracted data.
    pub residual: Array3<f64>,
    /// Variance propagated through point-source subtraction.
    pub variance: Array3<f64>,
    /// Continuum model cube.
    pub continuum_model: Array3<f64>,
    /// Sum of subtracted point-source models (zeros when the stage is off).
    pub psf_model: Array3<f64>,
    /// Union of the point-source subtraction apertures.
    pub psf_mask: Array2<bool>,
    /// Profile-fitted point sources in subtraction order.
    pub sources: Vec<SourceModel>,
    /// Point sources modelled slice by slice.
    pub slice_sources: Vec<SliceSourceModel>,
    /// Smoothed cube handed to the segmenter, when smoothing ran.
    pub smoothed: Option<SmoothResult>,
    /// Object labels.
    pub labels: Array3<u32>,
    /// Object table.
    pub objects: Vec<EmissionObject>,
    /// Diagnostics from every stage, in stage order.
    pub diagnostics: Diagnostics,
}

fn resolve_psf(
    config: &PipelineConfig,
    header: Option<&dyn CubeHeaderAdapter>,
) -> Result<Option<PsfConfig>, ExtractError> {
    match (&config.psf, &config.psf_physical) {
        (Some(psf), _) => Ok(Some(psf.clone())),
        (None, Some(physical)) => {
            let header = header.ok_or_else(|| {
                ExtractError::Configuration(
                    "psf_physical needs a cube header for unit conversion".to_string(),
                )
            })?;
            physical.to_voxel_units(header).map(Some)
        }
        (None, None) => Ok(None),
    }
}

/// Run the full extraction on one cube.
///
/// # Arguments
/// * `cube` - Data with its variance; segmentation requires variance
/// * `config` - Stage settings
/// * `header` - Wavelength axis and pixel scale; needed for physical PSF
///   settings and Angstrom continuum masks, and used for object centroid
///   wavelengths
/// * `optimizer` - Minimizer behind every point-source profile fit
///
/// # Errors
/// * [`ExtractError::Configuration`] for invalid settings or a cube without
///   variance
/// * [`ExtractError::DataShape`] from any stage
pub fn run_pipeline(
    cube: &DataCube,
    config: &PipelineConfig,
    header: Option<&dyn CubeHeaderAdapter>,
    optimizer: &dyn Optimizer,
) -> Result<PipelineOutput, ExtractError> {
    config.validate()?;
    if cube.variance.is_none() {
        return Err(ExtractError::Configuration(
            "the extraction pipeline requires a variance cube".to_string(),
        ));
    }
    let psf_config = resolve_psf(config, header)?;
    let started = Instant::now();
    let mut diagnostics = Diagnostics::new();

    let continuum_config = match header {
        Some(header) => config.continuum.to_layer_units(header),
        None => config.continuum.clone(),
    };
    let continuum = subtract_continuum(cube, &continuum_config, None)?;
    diagnostics.extend(continuum.diagnostics);

    let (residual, psf_model, psf_mask, sources, slice_sources) = match psf_config {
        Some(psf) => {
            let result = psf_sub_all(&continuum.subtracted, &psf, optimizer)?;
            diagnostics.extend(result.diagnostics);
            (
                result.residual,
                result.model,
                result.mask,
                result.sources,
                result.slice_sources,
            )
        }
        None => {
            let shape = cube.dim();
            (
                continuum.subtracted,
                Array3::zeros(shape),
                Array2::from_elem(cube.spatial_dim(), false),
                Vec::new(),
                Vec::new(),
            )
        }
    };

    let smoothed = match &config.smooth {
        Some(smooth) => {
            let mut result = smooth_cube(&residual, smooth)?;
            diagnostics.extend(std::mem::take(&mut result.diagnostics));
            Some(result)
        }
        None => None,
    };

    let target = smoothed.as_ref().map(|s| &s.cube).unwrap_or(&residual);
    let variance = target.variance.as_ref().ok_or_else(|| {
        ExtractError::Configuration("segmentation requires a variance cube".to_string())
    })?;
    let axis = header.map(|h| h.wavelength_axis());
    let segmentation = segment(
        &target.data.view(),
        &variance.view(),
        &config.segment,
        None,
        None,
        axis.as_ref(),
    )?;

    log::info!(
        "Pipeline finished in {:.1} ms: {} point sources, {} objects, {} diagnostics",
        started.elapsed().as_secs_f64() * 1000.0,
        sources.len() + slice_sources.len(),
        segmentation.objects.len(),
        diagnostics.len()
    );

    let DataCube {
        data: residual,
        variance: residual_variance,
    } = residual;

    Ok(PipelineOutput {
        residual,
        variance: residual_variance.unwrap_or_else(|| Array3::zeros(cube.dim())),
        continuum_model: continuum.model,
        psf_model,
        psf_mask,
        sources,
        slice_sources,
        smoothed,
        labels: segmentation.labels,
        objects: segmentation.objects,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuum::{BackgroundMethod, ContinuumConfig, WavelengthMask};
    use crate::header::{LinearHeader, WavelengthAxis};
    use crate::psf::PhysicalPsfConfig;
    use nebula_math::{DifferentialEvolution, Minimum, OptimizeError};
    use test_helpers::uniform_cube;

    fn optimizer() -> DifferentialEvolution {
        DifferentialEvolution::default()
    }

    fn header() -> LinearHeader {
        LinearHeader {
            wavelength: WavelengthAxis {
                start: 4800.0,
                step: 1.25,
                count: 8,
            },
            pixel_scale: 0.2,
        }
    }

    #[test]
    fn test_requires_variance() {
        let cube = DataCube::without_variance(uniform_cube((4, 6, 6), 1.0));
        assert!(matches!(
            run_pipeline(&cube, &PipelineConfig::default(), None, &optimizer()),
            Err(ExtractError::Configuration(_))
        ));
    }

    #[test]
    fn test_physical_psf_needs_header() {
        let cube = DataCube::new(uniform_cube((8, 6, 6), 1.0), Some(uniform_cube((8, 6, 6), 1.0))).unwrap();
        let config = PipelineConfig {
            psf_physical: Some(PhysicalPsfConfig {
                positions: Some(vec![(3.0, 3.0)]),
                ..PhysicalPsfConfig::default()
            }),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            run_pipeline(&cube, &config, None, &optimizer()),
            Err(ExtractError::Configuration(_))
        ));

        let resolved = resolve_psf(&config, Some(&header())).unwrap().unwrap();
        assert!((resolved.r_fit - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_flat_cube_yields_no_objects() {
        let shape = (8, 6, 6);
        let cube = DataCube::new(uniform_cube(shape, 3.0), Some(uniform_cube(shape, 1.0))).unwrap();

        let out = run_pipeline(&cube, &PipelineConfig::default(), Some(&header()), &optimizer())
            .unwrap();
        assert!(out.objects.is_empty());
        assert!(out.labels.iter().all(|&l| l == 0));
        assert!(out.residual.iter().all(|v| v.abs() < 1e-9));
        assert!(out.sources.is_empty());
        assert!(out.slice_sources.is_empty());
        assert!(out.smoothed.is_none());
        // The continuum model's own variance is added on top of the input.
        assert!(out.variance.iter().all(|&v| v > 1.0));
    }

    #[test]
    fn test_masked_line_survives_polynomial_continuum() {
        let shape = (8, 6, 6);
        let mut data = uniform_cube(shape, 3.0);
        for z in 3..5 {
            for y in 2..4 {
                for x in 2..4 {
                    data[[z, y, x]] += 20.0;
                }
            }
        }
        let cube = DataCube::new(data, Some(uniform_cube(shape, 1.0))).unwrap();
        let polynomial = ContinuumConfig {
            method: BackgroundMethod::Polynomial { order: 2 },
            ..ContinuumConfig::default()
        };
        // Layers 3 and 4 sit at 4803.75 and 4805.0 Angstrom.
        let masked = PipelineConfig {
            continuum: ContinuumConfig {
                wmasks: vec![WavelengthMask::Angstrom(4803.0, 4805.5)],
                ..polynomial.clone()
            },
            ..PipelineConfig::default()
        };
        let unmasked = PipelineConfig {
            continuum: polynomial,
            ..PipelineConfig::default()
        };

        let out = run_pipeline(&cube, &masked, Some(&header()), &optimizer()).unwrap();
        assert!((out.residual[[3, 2, 2]] - 20.0).abs() < 1e-6);
        assert!((out.continuum_model[[3, 2, 2]] - 3.0).abs() < 1e-6);
        assert!(out.objects.iter().any(|o| o.bbox.contains(3, 2, 2)));

        let leaked = run_pipeline(&cube, &unmasked, Some(&header()), &optimizer()).unwrap();
        assert!(leaked.residual[[3, 2, 2]] < 19.0);

        // Angstrom masks cannot be resolved without a header.
        assert!(matches!(
            run_pipeline(&cube, &masked, None, &optimizer()),
            Err(ExtractError::Configuration(_))
        ));
    }

    /// Always returns the centre of the box.
    struct CenterOfBounds;

    impl Optimizer for CenterOfBounds {
        fn minimize(
            &self,
            objective: &(dyn Fn(&[f64]) -> f64 + Sync),
            bounds: &[(f64, f64)],
            _seed: u64,
        ) -> Result<Minimum, OptimizeError> {
            let params: Vec<f64> = bounds.iter().map(|&(lo, hi)| 0.5 * (lo + hi)).collect();
            Ok(Minimum {
                cost: objective(&params),
                params,
                iterations: 0,
                converged: true,
            })
        }
    }

    #[test]
    fn test_caller_supplies_optimizer() {
        let shape = (4, 9, 9);
        let mut data = uniform_cube(shape, 0.0);
        data[[1, 4, 4]] = 10.0;
        let cube = DataCube::new(data, Some(uniform_cube(shape, 1.0))).unwrap();
        let config = PipelineConfig {
            continuum: ContinuumConfig {
                method: BackgroundMethod::None,
                ..ContinuumConfig::default()
            },
            psf: Some(PsfConfig {
                positions: Some(vec![(4.0, 4.0)]),
                recenter: false,
                ..PsfConfig::default()
            }),
            ..PipelineConfig::default()
        };

        let out = run_pipeline(&cube, &config, None, &CenterOfBounds).unwrap();
        assert_eq!(out.sources.len(), 1);
        // The fit lands wherever the supplied optimizer puts it.
        assert_eq!(out.sources[0].center(), (4.0, 4.0));
        assert_eq!(out.sources[0].recenter_iterations, 1);
    }
}
