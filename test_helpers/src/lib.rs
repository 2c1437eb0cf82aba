//! Test helpers for the nebula workspace
//!
//! Builders for synthetic IFU cubes indexed `(wavelength, y, x)`: flat
//! backgrounds, injected Gaussian point sources and seeded Gaussian noise.
//! Shared by the unit tests in `nebula-core` and its integration tests.

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Cube of the given `(nz, ny, nx)` shape filled with `value`.
pub fn uniform_cube(shape: (usize, usize, usize), value: f64) -> Array3<f64> {
    Array3::from_elem(shape, value)
}

/// Evaluate a circular 2D Gaussian of the given peak amplitude at `(x, y)`.
pub fn gaussian_2d(x: f64, y: f64, center: (f64, f64), amplitude: f64, sigma: f64) -> f64 {
    let dx = x - center.0;
    let dy = y - center.1;
    amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
}

/// Add a circular Gaussian point source to the given wavelength layers.
///
/// # Arguments
/// * `cube` - Cube to modify in place
/// * `center` - Source position as `(x, y)` in pixels
/// * `amplitude` - Peak amplitude of the profile in every listed layer
/// * `sigma` - Gaussian standard deviation in pixels
/// * `layers` - Wavelength layers receiving the source
pub fn inject_gaussian_source(
    cube: &mut Array3<f64>,
    center: (f64, f64),
    amplitude: f64,
    sigma: f64,
    layers: impl IntoIterator<Item = usize>,
) {
    let (_, ny, nx) = cube.dim();
    for z in layers {
        for y in 0..ny {
            for x in 0..nx {
                cube[[z, y, x]] += gaussian_2d(x as f64, y as f64, center, amplitude, sigma);
            }
        }
    }
}

/// Add a box of constant emission covering the inclusive voxel ranges.
pub fn inject_block(
    cube: &mut Array3<f64>,
    z: (usize, usize),
    y: (usize, usize),
    x: (usize, usize),
    value: f64,
) {
    for zi in z.0..=z.1 {
        for yi in y.0..=y.1 {
            for xi in x.0..=x.1 {
                cube[[zi, yi, xi]] += value;
            }
        }
    }
}

/// Add zero-mean Gaussian noise with standard deviation `sigma`.
///
/// Deterministic for a given `seed`.
pub fn add_gaussian_noise(cube: &mut Array3<f64>, sigma: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = match Normal::new(0.0, sigma) {
        Ok(n) => n,
        Err(_) => return,
    };
    cube.iter_mut().for_each(|v| *v += normal.sample(&mut rng));
}

/// Sum of all finite voxels.
pub fn total_flux(cube: &Array3<f64>) -> f64 {
    cube.iter().filter(|v| v.is_finite()).sum()
}
