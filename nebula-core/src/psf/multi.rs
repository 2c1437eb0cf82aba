//! Multi-source subtraction as a sequential fold.
//!
//! Sources are resolved from exactly one of an explicit position list, a
//! region list or automatic detection, then subtracted one after another:
//! each fit sees the residual left by every earlier subtraction, so flux
//! shared by overlapping apertures is only removed once. Sources are never
//! processed in parallel.

use std::time::Instant;

use nebula_math::Optimizer;

use super::detect::detect_sources;
use super::subtract::{fit_layers, subtract_step, usable_layers, PsfResult};
use super::PsfConfig;
use crate::cube::{white_light, DataCube};
use crate::error::ExtractError;
use crate::mask::{RegionShape, RegionSource};

/// Where the candidate source positions come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSelection {
    /// Centers of the given regions, in list order.
    Regions(Vec<RegionShape>),
    /// Explicit `(x, y)` positions, in list order.
    Positions(Vec<(f64, f64)>),
    /// Peaks of the full-window white-light image above `threshold` SNR,
    /// strongest first.
    Auto {
        /// Detection SNR threshold.
        threshold: f64,
    },
}

impl SourceSelection {
    /// Resolve the selection from the configuration.
    ///
    /// # Errors
    /// [`ExtractError::Configuration`] unless exactly one of `positions`,
    /// `regions` and `auto_threshold` is set.
    pub fn from_config(config: &PsfConfig) -> Result<Self, ExtractError> {
        let given = [
            config.positions.is_some(),
            config.regions.is_some(),
            config.auto_threshold.is_some(),
        ]
        .iter()
        .filter(|&&g| g)
        .count();

        if given != 1 {
            return Err(ExtractError::Configuration(format!(
                "exactly one of positions, regions or auto_threshold must be given ({given} supplied)"
            )));
        }

        if let Some(positions) = &config.positions {
            Ok(SourceSelection::Positions(positions.clone()))
        } else if let Some(regions) = &config.regions {
            Ok(SourceSelection::Regions(regions.clone()))
        } else {
            Ok(SourceSelection::Auto {
                threshold: config.auto_threshold.unwrap_or_default(),
            })
        }
    }

    /// Regions supplied by a collaborator, typically a parsed region file.
    pub fn from_region_source(source: &dyn RegionSource) -> Self {
        SourceSelection::Regions(source.regions())
    }

    /// Ordered source positions for `cube`.
    pub fn positions(&self, cube: &DataCube, config: &PsfConfig) -> Vec<(f64, f64)> {
        match self {
            SourceSelection::Positions(positions) => positions.clone(),
            SourceSelection::Regions(regions) => regions.iter().map(RegionShape::center).collect(),
            SourceSelection::Auto { threshold } => {
                let (nz, _, _) = cube.dim();
                let layers = usable_layers(nz, config);
                let variance = cube.variance.as_ref().map(|v| v.view());
                let (image, var_image) =
                    white_light(&cube.data.view(), variance.as_ref(), &layers.view());

                detect_sources(
                    &image.view(),
                    var_image.as_ref().map(|v| v.view()).as_ref(),
                    *threshold,
                    config.r_sub,
                )
                .into_iter()
                .map(|d| d.position)
                .collect()
            }
        }
    }
}

/// Fit and subtract every selected point source.
///
/// # Arguments
/// * `cube` - Data and optional variance
/// * `config` - Subtraction settings, including the source selection
/// * `optimizer` - Bounded minimizer; source `i` is fitted with seed
///   `config.seed + i`
///
/// # Returns
/// The accumulated residual, model, aperture mask, fitted sources and
/// diagnostics of the whole fold.
///
/// # Errors
/// [`ExtractError::Configuration`] for an invalid configuration or a
/// selection that is not exactly one of positions, regions or auto.
pub fn psf_sub_all(
    cube: &DataCube,
    config: &PsfConfig,
    optimizer: &dyn Optimizer,
) -> Result<PsfResult, ExtractError> {
    config.validate()?;
    let selection = SourceSelection::from_config(config)?;
    subtract_selected(cube, config, &selection, optimizer)
}

/// Fit and subtract the sources at the centers of `regions`, in order.
///
/// Same fold as [`psf_sub_all`], with the source list taken from a region
/// source instead of the configuration.
///
/// # Errors
/// [`ExtractError::Configuration`] for an invalid configuration, or when
/// the configuration also selects positions, regions or auto detection.
pub fn psf_sub_regions(
    cube: &DataCube,
    config: &PsfConfig,
    regions: &dyn RegionSource,
    optimizer: &dyn Optimizer,
) -> Result<PsfResult, ExtractError> {
    config.validate()?;
    if config.positions.is_some() || config.regions.is_some() || config.auto_threshold.is_some() {
        return Err(ExtractError::Configuration(
            "a region source excludes positions, regions and auto_threshold in the config"
                .to_string(),
        ));
    }
    let selection = SourceSelection::from_region_source(regions);
    subtract_selected(cube, config, &selection, optimizer)
}

fn subtract_selected(
    cube: &DataCube,
    config: &PsfConfig,
    selection: &SourceSelection,
    optimizer: &dyn Optimizer,
) -> Result<PsfResult, ExtractError> {
    let started = Instant::now();

    let positions = selection.positions(cube, config);
    let (nz, _, _) = cube.dim();
    let layers = fit_layers(nz, config);

    log::debug!(
        "Multi-source subtraction of {} candidates ({:?}, {:?} profile, r_fit={}, r_sub={})",
        positions.len(),
        config.method,
        config.profile,
        config.r_fit,
        config.r_sub
    );

    let result = positions
        .iter()
        .enumerate()
        .try_fold(PsfResult::start(cube), |state, (index, &position)| {
            subtract_step(state, index, position, config, optimizer, &layers.view())
        })?;

    log::info!(
        "Subtracted {} of {} point sources in {:.1} ms",
        result.source_count(),
        positions.len(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(result)
}
