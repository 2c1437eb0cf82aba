//! Region primitives and their rasterization into spatial masks.
//!
//! Regions arrive from a region-file collaborator as an ordered list of
//! circles, boxes and ellipses. Centers are always pixel coordinates
//! `(x, y)` (sky positions are resolved by the collaborator); sizes may be
//! given in pixels or arcseconds.
//!
//! Rasterization uses the pixel-center rule: a pixel belongs to a region
//! when its center lies inside it. Overlapping regions union; parts
//! falling outside the image are clipped.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

/// Units of region sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionUnits {
    /// Sizes in pixels.
    #[default]
    Pixels,
    /// Sizes in arcseconds, converted with the plate scale.
    Arcsec,
}

/// Geometric region primitive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum RegionShape {
    /// Circle of the given radius.
    Circle {
        /// Center `(x, y)` in pixels.
        center: (f64, f64),
        /// Radius.
        radius: f64,
        /// Size units.
        #[serde(default)]
        units: RegionUnits,
    },
    /// Rectangle, optionally rotated.
    Box {
        /// Center `(x, y)` in pixels.
        center: (f64, f64),
        /// Full width along the (rotated) x axis.
        width: f64,
        /// Full height along the (rotated) y axis.
        height: f64,
        /// Counter-clockwise rotation in degrees.
        #[serde(default)]
        angle: f64,
        /// Size units.
        #[serde(default)]
        units: RegionUnits,
    },
    /// Ellipse, optionally rotated.
    Ellipse {
        /// Center `(x, y)` in pixels.
        center: (f64, f64),
        /// Semi-axis along the (rotated) x axis.
        semi_major: f64,
        /// Semi-axis along the (rotated) y axis.
        semi_minor: f64,
        /// Counter-clockwise rotation in degrees.
        #[serde(default)]
        angle: f64,
        /// Size units.
        #[serde(default)]
        units: RegionUnits,
    },
}

impl RegionShape {
    /// Center `(x, y)` in pixels.
    pub fn center(&self) -> (f64, f64) {
        match *self {
            RegionShape::Circle { center, .. }
            | RegionShape::Box { center, .. }
            | RegionShape::Ellipse { center, .. } => center,
        }
    }

    fn units(&self) -> RegionUnits {
        match *self {
            RegionShape::Circle { units, .. }
            | RegionShape::Box { units, .. }
            | RegionShape::Ellipse { units, .. } => units,
        }
    }

    /// Copy of the region with sizes expressed in pixels.
    ///
    /// # Errors
    /// [`ExtractError::Configuration`] for arcsec sizes without a plate scale.
    pub fn to_pixels(&self, pixel_scale: Option<f64>) -> Result<RegionShape, ExtractError> {
        let factor = match (self.units(), pixel_scale) {
            (RegionUnits::Pixels, _) => 1.0,
            (RegionUnits::Arcsec, Some(scale)) if scale > 0.0 => 1.0 / scale,
            (RegionUnits::Arcsec, _) => {
                return Err(ExtractError::Configuration(
                    "region sizes in arcsec need a positive pixel scale".to_string(),
                ))
            }
        };

        Ok(match *self {
            RegionShape::Circle { center, radius, .. } => RegionShape::Circle {
                center,
                radius: radius * factor,
                units: RegionUnits::Pixels,
            },
            RegionShape::Box {
                center,
                width,
                height,
                angle,
                ..
            } => RegionShape::Box {
                center,
                width: width * factor,
                height: height * factor,
                angle,
                units: RegionUnits::Pixels,
            },
            RegionShape::Ellipse {
                center,
                semi_major,
                semi_minor,
                angle,
                ..
            } => RegionShape::Ellipse {
                center,
                semi_major: semi_major * factor,
                semi_minor: semi_minor * factor,
                angle,
                units: RegionUnits::Pixels,
            },
        })
    }

    /// Radius of a circle enclosing the region, in the region's units.
    fn extent(&self) -> f64 {
        match *self {
            RegionShape::Circle { radius, .. } => radius,
            RegionShape::Box { width, height, .. } => 0.5 * width.hypot(height),
            RegionShape::Ellipse {
                semi_major,
                semi_minor,
                ..
            } => semi_major.max(semi_minor),
        }
    }

    /// Whether the point `(x, y)` lies inside the region (pixel units).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let (cx, cy) = self.center();
        let dx = x - cx;
        let dy = y - cy;

        match *self {
            RegionShape::Circle { radius, .. } => dx * dx + dy * dy <= radius * radius,
            RegionShape::Box {
                width,
                height,
                angle,
                ..
            } => {
                let (u, v) = rotate_into_frame(dx, dy, angle);
                u.abs() <= width / 2.0 + EDGE_TOLERANCE && v.abs() <= height / 2.0 + EDGE_TOLERANCE
            }
            RegionShape::Ellipse {
                semi_major,
                semi_minor,
                angle,
                ..
            } => {
                if semi_major <= 0.0 || semi_minor <= 0.0 {
                    return false;
                }
                let (u, v) = rotate_into_frame(dx, dy, angle);
                (u / semi_major).powi(2) + (v / semi_minor).powi(2) <= 1.0 + EDGE_TOLERANCE
            }
        }
    }
}

/// Slack absorbing rounding in rotated-frame coordinates, so that pixel
/// centers exactly on an edge stay inside at angles like 90 degrees.
const EDGE_TOLERANCE: f64 = 1e-9;

/// Express an offset in the frame of a shape rotated by `angle` degrees.
fn rotate_into_frame(dx: f64, dy: f64, angle: f64) -> (f64, f64) {
    let (sin, cos) = angle.to_radians().sin_cos();
    (dx * cos + dy * sin, -dx * sin + dy * cos)
}

/// Source of an ordered region list (typically a parsed region file).
pub trait RegionSource {
    /// Regions in file order.
    fn regions(&self) -> Vec<RegionShape>;
}

impl RegionSource for Vec<RegionShape> {
    fn regions(&self) -> Vec<RegionShape> {
        self.clone()
    }
}

impl RegionSource for [RegionShape] {
    fn regions(&self) -> Vec<RegionShape> {
        self.to_vec()
    }
}

/// Rasterize regions into a 2D boolean mask of shape `(ny, nx)`.
///
/// # Arguments
/// * `shape` - Mask shape `(ny, nx)`
/// * `regions` - Region list; overlapping regions union
/// * `pixel_scale` - Plate scale (arcsec/pixel), required for arcsec sizes
///
/// # Returns
/// Mask with `true` inside any region. Regions partially or entirely
/// outside the image are clipped, never an error.
pub fn region_to_mask(
    shape: (usize, usize),
    regions: &[RegionShape],
    pixel_scale: Option<f64>,
) -> Result<Array2<bool>, ExtractError> {
    let (ny, nx) = shape;
    let mut mask = Array2::from_elem((ny, nx), false);

    for region in regions {
        let region = region.to_pixels(pixel_scale)?;
        let (cx, cy) = region.center();
        let reach = region.extent().ceil() + 1.0;

        let x_min = (cx - reach).floor().max(0.0) as usize;
        let y_min = (cy - reach).floor().max(0.0) as usize;
        let x_max = ((cx + reach).ceil().max(-1.0) + 1.0).min(nx as f64) as usize;
        let y_max = ((cy + reach).ceil().max(-1.0) + 1.0).min(ny as f64) as usize;

        for y in y_min..y_max {
            for x in x_min..x_max {
                if region.contains(x as f64, y as f64) {
                    mask[[y, x]] = true;
                }
            }
        }
    }

    Ok(mask)
}
