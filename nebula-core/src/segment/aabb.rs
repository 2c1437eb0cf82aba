//! Axis-aligned bounding boxes in cube index space.

use serde::Serialize;

/// Axis-aligned bounding box of a 3D region, `(z, y, x)` indexed.
///
/// Both bounds are inclusive. A box built with [`Aabb3::new`] is empty
/// (min above max) until a voxel is added with
/// [`Aabb3::expand_to_include`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Aabb3 {
    /// Minimum wavelength layer (inclusive)
    pub min_z: usize,
    /// Minimum row (inclusive)
    pub min_y: usize,
    /// Minimum column (inclusive)
    pub min_x: usize,
    /// Maximum wavelength layer (inclusive)
    pub max_z: usize,
    /// Maximum row (inclusive)
    pub max_y: usize,
    /// Maximum column (inclusive)
    pub max_x: usize,
}

impl Aabb3 {
    /// Create an empty box with invalid bounds.
    pub fn new() -> Self {
        Self {
            min_z: usize::MAX,
            min_y: usize::MAX,
            min_x: usize::MAX,
            max_z: 0,
            max_y: 0,
            max_x: 0,
        }
    }

    /// Grow the box so it contains voxel `(z, y, x)`.
    pub fn expand_to_include(&mut self, z: usize, y: usize, x: usize) {
        self.min_z = self.min_z.min(z);
        self.min_y = self.min_y.min(y);
        self.min_x = self.min_x.min(x);
        self.max_z = self.max_z.max(z);
        self.max_y = self.max_y.max(y);
        self.max_x = self.max_x.max(x);
    }

    /// True once at least one voxel has been added.
    pub fn is_valid(&self) -> bool {
        self.min_z <= self.max_z && self.min_y <= self.max_y && self.min_x <= self.max_x
    }

    /// Extent `(depth, height, width)` in voxels; zero for an empty box.
    pub fn dims(&self) -> (usize, usize, usize) {
        if !self.is_valid() {
            return (0, 0, 0);
        }
        (
            self.max_z - self.min_z + 1,
            self.max_y - self.min_y + 1,
            self.max_x - self.min_x + 1,
        )
    }

    /// Number of voxels enclosed by the box.
    pub fn volume(&self) -> usize {
        let (d, h, w) = self.dims();
        d * h * w
    }

    /// Geometric centre `(z, y, x)`.
    pub fn center(&self) -> (f64, f64, f64) {
        (
            (self.min_z + self.max_z) as f64 / 2.0,
            (self.min_y + self.max_y) as f64 / 2.0,
            (self.min_x + self.max_x) as f64 / 2.0,
        )
    }

    /// True if the voxel lies inside the box.
    pub fn contains(&self, z: usize, y: usize, x: usize) -> bool {
        (self.min_z..=self.max_z).contains(&z)
            && (self.min_y..=self.max_y).contains(&y)
            && (self.min_x..=self.max_x).contains(&x)
    }
}

impl Default for Aabb3 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_box() {
        let aabb = Aabb3::new();
        assert!(!aabb.is_valid());
        assert_eq!(aabb.volume(), 0);
    }

    #[test]
    fn test_expand_to_include() {
        let mut aabb = Aabb3::new();
        aabb.expand_to_include(2, 5, 1);
        assert!(aabb.is_valid());
        assert_eq!(aabb.dims(), (1, 1, 1));

        aabb.expand_to_include(4, 3, 6);
        assert_eq!(aabb.dims(), (3, 3, 6));
        assert_eq!(aabb.volume(), 54);
        assert_eq!(aabb.center(), (3.0, 4.0, 3.5));
        assert!(aabb.contains(3, 4, 2));
        assert!(!aabb.contains(5, 4, 2));
    }
}
