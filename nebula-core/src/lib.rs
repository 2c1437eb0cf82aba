//! nebula-core - Nebular signal extraction for IFU data cubes
//!
//! Turns a `(wavelength, y, x)` flux cube and its variance into a residual
//! cube holding only extended line emission, plus a labeled object volume:
//!
//! - **continuum**: per-spaxel or per-layer background models (polynomial,
//!   running median) fitted to unmasked samples outside excluded wavelength
//!   ranges, and subtracted together with their variance
//! - **psf**: white-light profile fits (Gaussian or Moffat) with iterative
//!   recentering, per-layer amplitude scaling and sequential multi-source
//!   subtraction with variance propagation; a slice-by-slice scaled
//!   white-light model as an alternative
//! - **smooth**: separable box/Gaussian smoothing with exact variance
//!   propagation, and adaptive box smoothing to a target SNR
//! - **segment**: SNR thresholding and 3D connected-component labeling into
//!   emission objects
//! - **mask**: boolean and label masks, region rasterisation
//! - **pipeline**: the stages above chained under one [`PipelineConfig`]
//!
//! Recoverable per-unit problems are returned as [`Diagnostics`]; shape and
//! configuration problems are [`ExtractError`]s raised before any work.

pub mod aperture;
pub mod config;
pub mod continuum;
pub mod cube;
pub mod error;
pub mod header;
pub mod mask;
pub mod pipeline;
pub mod psf;
pub mod segment;
pub mod smooth;

pub use config::PipelineConfig;
pub use continuum::{
    subtract_continuum, BackgroundMethod, ContinuumConfig, ContinuumResult, SliceAxis,
    WavelengthMask,
};
pub use cube::{white_light, window_layers, DataCube};
pub use error::{Diagnostic, Diagnostics, ExtractError};
pub use header::{CubeHeaderAdapter, LinearHeader, WavelengthAxis};
pub use mask::{
    apply_label_mask, apply_mask, combine_masks, label_to_binary, region_to_mask, RegionShape,
    RegionSource, RegionUnits, VoxelMask,
};
pub use pipeline::{run_pipeline, PipelineOutput};
pub use psf::{
    psf_sub, psf_sub_all, psf_sub_regions, PhysicalPsfConfig, PsfConfig, PsfMethod, PsfProfile,
    PsfResult, SliceDirection, SliceSettings, SliceSourceModel, SourceModel, SourceSelection,
};
pub use segment::{segment, Connectivity, EmissionObject, SegmentConfig, Segmentation};
pub use smooth::{
    smooth_cube, smooth_cube_spatial, smooth_cube_wavelength, smooth_nd, EdgeMode, KernelType,
    SmoothConfig, SmoothResult,
};
