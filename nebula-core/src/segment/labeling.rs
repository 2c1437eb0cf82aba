//! 3D connected-component labeling with union-find.
//!
//! Two-pass algorithm over raster order `(z, y, x)`:
//! 1. **First pass**: assign provisional labels, looking only at already
//!    visited neighbours, and record equivalences in a parent table
//! 2. **Resolve**: flatten the parent table with path compression
//! 3. **Second pass**: relabel with consecutive ids in order of first
//!    appearance

use std::str::FromStr;

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

/// Voxel adjacency used for labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Connectivity {
    /// Shared faces only.
    #[serde(rename = "6")]
    Six,
    /// Shared faces or edges.
    #[serde(rename = "18")]
    Eighteen,
    /// Shared faces, edges or corners.
    #[default]
    #[serde(rename = "26")]
    TwentySix,
}

impl Connectivity {
    /// Maximum number of non-zero offset components for a neighbour.
    fn max_order(self) -> usize {
        match self {
            Connectivity::Six => 1,
            Connectivity::Eighteen => 2,
            Connectivity::TwentySix => 3,
        }
    }

    /// Offsets of neighbours that precede a voxel in raster order.
    fn previous_offsets(self) -> Vec<(isize, isize, isize)> {
        let mut offsets = Vec::new();
        for dz in -1isize..=1 {
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    if (dz, dy, dx) >= (0, 0, 0) {
                        continue;
                    }
                    let order = [dz, dy, dx].iter().filter(|&&d| d != 0).count();
                    if order <= self.max_order() {
                        offsets.push((dz, dy, dx));
                    }
                }
            }
        }
        offsets
    }
}

impl FromStr for Connectivity {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "6" => Ok(Connectivity::Six),
            "18" => Ok(Connectivity::Eighteen),
            "26" => Ok(Connectivity::TwentySix),
            _ => Err(ExtractError::Configuration(format!(
                "unknown connectivity '{s}'. Valid options: 6, 18, 26"
            ))),
        }
    }
}

/// Find the root label in the parent table, compressing the path.
fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

/// Merge the sets of two labels; the smaller root becomes the parent.
fn union_labels(parents: &mut [usize], a: usize, b: usize) -> usize {
    let root_a = find_root(parents, a);
    let root_b = find_root(parents, b);
    if root_a < root_b {
        parents[root_b] = root_a;
        root_a
    } else {
        parents[root_a] = root_b;
        root_b
    }
}

/// Label connected regions of `true` voxels.
///
/// # Arguments
/// * `mask` - Candidate voxels
/// * `connectivity` - Neighbour definition
///
/// # Returns
/// Label volume (0 background, 1..=N in order of first appearance) and N.
pub fn connected_components_3d(
    mask: &ArrayView3<bool>,
    connectivity: Connectivity,
) -> (Array3<u32>, usize) {
    let (nz, ny, nx) = mask.dim();
    let offsets = connectivity.previous_offsets();
    let mut provisional: Array3<usize> = Array3::zeros((nz, ny, nx));
    let mut parents = vec![0usize];

    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if !mask[[z, y, x]] {
                    continue;
                }

                let mut neighbours = Vec::with_capacity(offsets.len());
                for &(dz, dy, dx) in &offsets {
                    let (iz, iy, ix) = (z as isize + dz, y as isize + dy, x as isize + dx);
                    if iz < 0 || iy < 0 || ix < 0 || iy >= ny as isize || ix >= nx as isize {
                        continue;
                    }
                    let label = provisional[[iz as usize, iy as usize, ix as usize]];
                    if label > 0 {
                        neighbours.push(label);
                    }
                }

                match neighbours.iter().min() {
                    None => {
                        let label = parents.len();
                        parents.push(label);
                        provisional[[z, y, x]] = label;
                    }
                    Some(&min_label) => {
                        provisional[[z, y, x]] = min_label;
                        for &other in &neighbours {
                            if other != min_label {
                                union_labels(&mut parents, min_label, other);
                            }
                        }
                    }
                }
            }
        }
    }

    for i in 1..parents.len() {
        find_root(&mut parents, i);
    }

    let mut relabel = vec![0u32; parents.len()];
    let mut next = 0u32;
    for i in 1..parents.len() {
        let root = parents[i];
        if relabel[root] == 0 {
            next += 1;
            relabel[root] = next;
        }
        relabel[i] = relabel[root];
    }

    (provisional.mapv(|l| relabel[l]), next as usize)
}

/// Drop components smaller than `min_voxels` and renumber the rest 1..=N.
///
/// Surviving labels keep their relative order. Returns N.
pub fn remove_small_components(labels: &mut Array3<u32>, count: usize, min_voxels: usize) -> usize {
    let mut sizes = vec![0usize; count + 1];
    for &l in labels.iter() {
        sizes[l as usize] += 1;
    }

    let mut remap = vec![0u32; count + 1];
    let mut next = 0u32;
    for label in 1..=count {
        if sizes[label] >= min_voxels {
            next += 1;
            remap[label] = next;
        }
    }

    labels.mapv_inplace(|l| remap[l as usize]);
    next as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(voxels: &[(usize, usize, usize)], shape: (usize, usize, usize)) -> Array3<bool> {
        let mut mask = Array3::from_elem(shape, false);
        for &v in voxels {
            mask[v] = true;
        }
        mask
    }

    #[test]
    fn test_previous_offset_counts() {
        assert_eq!(Connectivity::Six.previous_offsets().len(), 3);
        assert_eq!(Connectivity::Eighteen.previous_offsets().len(), 9);
        assert_eq!(Connectivity::TwentySix.previous_offsets().len(), 13);
    }

    #[test]
    fn test_corner_touching_voxels() {
        let mask = mask_from(&[(0, 0, 0), (1, 1, 1)], (2, 2, 2));

        let (_, n26) = connected_components_3d(&mask.view(), Connectivity::TwentySix);
        let (_, n18) = connected_components_3d(&mask.view(), Connectivity::Eighteen);
        let (_, n6) = connected_components_3d(&mask.view(), Connectivity::Six);
        assert_eq!((n26, n18, n6), (1, 2, 2));
    }

    #[test]
    fn test_edge_touching_voxels() {
        let mask = mask_from(&[(0, 0, 0), (1, 1, 0)], (2, 2, 2));
        let (_, n18) = connected_components_3d(&mask.view(), Connectivity::Eighteen);
        let (_, n6) = connected_components_3d(&mask.view(), Connectivity::Six);
        assert_eq!((n18, n6), (1, 2));
    }

    #[test]
    fn test_u_shape_merges_through_equivalence() {
        // Two arms joined only at the far end of the cube.
        let mut voxels = Vec::new();
        for z in 0..4 {
            voxels.push((z, 0, 0));
            voxels.push((z, 0, 3));
        }
        for x in 0..4 {
            voxels.push((3, 0, x));
        }
        let mask = mask_from(&voxels, (4, 1, 4));

        let (labels, n) = connected_components_3d(&mask.view(), Connectivity::Six);
        assert_eq!(n, 1);
        assert_eq!(labels[[0, 0, 0]], 1);
        assert_eq!(labels[[0, 0, 3]], 1);
    }

    #[test]
    fn test_labels_follow_first_appearance() {
        let mask = mask_from(&[(0, 0, 3), (1, 0, 0), (1, 2, 2)], (2, 3, 4));
        let (labels, n) = connected_components_3d(&mask.view(), Connectivity::TwentySix);
        assert_eq!(n, 3);
        assert_eq!(labels[[0, 0, 3]], 1);
        assert_eq!(labels[[1, 0, 0]], 2);
        assert_eq!(labels[[1, 2, 2]], 3);
    }

    #[test]
    fn test_remove_small_components_renumbers() {
        let mask = mask_from(&[(0, 0, 0), (0, 0, 3), (0, 1, 3), (0, 2, 3)], (1, 3, 4));
        let (mut labels, n) = connected_components_3d(&mask.view(), Connectivity::TwentySix);
        assert_eq!(n, 2);

        let kept = remove_small_components(&mut labels, n, 2);
        assert_eq!(kept, 1);
        assert_eq!(labels[[0, 0, 0]], 0);
        assert_eq!(labels[[0, 2, 3]], 1);
    }

    #[test]
    fn test_connectivity_names() {
        assert_eq!("18".parse::<Connectivity>().unwrap(), Connectivity::Eighteen);
        assert!("4".parse::<Connectivity>().is_err());
        assert_eq!(Connectivity::default(), Connectivity::TwentySix);
    }
}
