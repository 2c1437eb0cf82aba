//! Bounded global minimization.
//!
//! The extraction engine only relies on the [`Optimizer`] contract:
//! minimize a scalar objective inside box bounds, deterministically for a
//! given seed. [`DifferentialEvolution`] is the stock implementation
//! (rand/1 mutation toward the current best, binomial crossover, dithered
//! mutation factor), evaluating each generation's trial vectors in
//! parallel with rayon. All random draws happen on the calling thread in a
//! fixed order, so parallel evaluation does not affect the result.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

/// Errors from bounded minimization.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    /// No parameters to optimize.
    #[error("no bounds supplied")]
    EmptyBounds,

    /// A bound has `lower > upper` or a non-finite limit.
    #[error("invalid bound for parameter {index}: [{lower}, {upper}]")]
    InvalidBound {
        /// Parameter index.
        index: usize,
        /// Lower limit.
        lower: f64,
        /// Upper limit.
        upper: f64,
    },

    /// The objective never produced a finite cost.
    #[error("objective returned no finite cost over the initial population")]
    NonFiniteCost,
}

/// Result of a bounded minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    /// Best parameter vector found.
    pub params: Vec<f64>,
    /// Objective value at `params`.
    pub cost: f64,
    /// Number of generations (iterations) executed.
    pub iterations: usize,
    /// Whether the population met the convergence criterion before the
    /// iteration cap.
    pub converged: bool,
}

impl Minimum {
    /// Indices of parameters lying within `rel_tol` of the bound width
    /// from either limit.
    ///
    /// A parameter pinned at a bound usually means the fit is poorly
    /// constrained (or the bound is too tight).
    pub fn parameters_at_bounds(&self, bounds: &[(f64, f64)], rel_tol: f64) -> Vec<usize> {
        let mut pinned = Vec::new();
        for (i, (p, &(lo, hi))) in self.params.iter().zip(bounds.iter()).enumerate() {
            let tol = rel_tol * (hi - lo).abs();
            if (p - lo).abs() <= tol || (hi - p).abs() <= tol {
                pinned.push(i);
            }
        }
        pinned
    }
}

/// Bounded global minimizer contract.
///
/// Implementations must keep every evaluated parameter vector inside the
/// bounds and must be deterministic for a fixed `seed`.
pub trait Optimizer: Send + Sync {
    /// Minimize `objective` over the box `bounds` (one `(lower, upper)`
    /// pair per parameter).
    fn minimize(
        &self,
        objective: &(dyn Fn(&[f64]) -> f64 + Sync),
        bounds: &[(f64, f64)],
        seed: u64,
    ) -> Result<Minimum, OptimizeError>;
}

/// Differential evolution (best/1/bin with dithering).
#[derive(Debug, Clone, PartialEq)]
pub struct DifferentialEvolution {
    /// Population size as a multiple of the parameter count.
    pub population_factor: usize,
    /// Generation cap; guarantees termination.
    pub max_iterations: usize,
    /// Mutation factor range; a factor is drawn uniformly per generation.
    pub mutation: (f64, f64),
    /// Crossover probability.
    pub crossover: f64,
    /// Relative convergence tolerance on the spread of population costs.
    pub tolerance: f64,
    /// Absolute convergence tolerance on the spread of population costs.
    pub abs_tolerance: f64,
    /// Evaluate trial vectors on the rayon pool.
    pub parallel: bool,
}

impl Default for DifferentialEvolution {
    fn default() -> Self {
        Self {
            population_factor: 15,
            max_iterations: 400,
            mutation: (0.5, 1.0),
            crossover: 0.9,
            tolerance: 1e-10,
            abs_tolerance: 1e-14,
            parallel: true,
        }
    }
}

fn validate_bounds(bounds: &[(f64, f64)]) -> Result<(), OptimizeError> {
    if bounds.is_empty() {
        return Err(OptimizeError::EmptyBounds);
    }

    for (index, &(lower, upper)) in bounds.iter().enumerate() {
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(OptimizeError::InvalidBound {
                index,
                lower,
                upper,
            });
        }
    }

    Ok(())
}

fn sanitize(cost: f64) -> f64 {
    if cost.is_nan() {
        f64::INFINITY
    } else {
        cost
    }
}

impl DifferentialEvolution {
    fn evaluate(
        &self,
        objective: &(dyn Fn(&[f64]) -> f64 + Sync),
        candidates: &[Vec<f64>],
    ) -> Vec<f64> {
        if self.parallel {
            candidates
                .par_iter()
                .map(|c| sanitize(objective(c)))
                .collect()
        } else {
            candidates.iter().map(|c| sanitize(objective(c))).collect()
        }
    }

    fn has_converged(&self, costs: &[f64]) -> bool {
        let finite: Vec<f64> = costs.iter().copied().filter(|c| c.is_finite()).collect();
        if finite.len() != costs.len() {
            return false;
        }

        let n = finite.len() as f64;
        let mean = finite.iter().sum::<f64>() / n;
        let spread = (finite.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n).sqrt();
        spread <= self.abs_tolerance + self.tolerance * mean.abs()
    }
}

fn best_index(costs: &[f64]) -> usize {
    costs
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

impl Optimizer for DifferentialEvolution {
    fn minimize(
        &self,
        objective: &(dyn Fn(&[f64]) -> f64 + Sync),
        bounds: &[(f64, f64)],
        seed: u64,
    ) -> Result<Minimum, OptimizeError> {
        validate_bounds(bounds)?;

        let dim = bounds.len();
        let pop_size = (self.population_factor * dim).max(5);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut population: Vec<Vec<f64>> = (0..pop_size)
            .map(|_| {
                bounds
                    .iter()
                    .map(|&(lo, hi)| lo + rng.gen::<f64>() * (hi - lo))
                    .collect()
            })
            .collect();
        let mut costs = self.evaluate(objective, &population);

        if costs.iter().all(|c| !c.is_finite()) {
            return Err(OptimizeError::NonFiniteCost);
        }

        let mut iterations = 0;
        let mut converged = self.has_converged(&costs);

        while !converged && iterations < self.max_iterations {
            iterations += 1;

            let best = population[best_index(&costs)].clone();
            let factor = rng.gen_range(self.mutation.0..=self.mutation.1);

            let trials: Vec<Vec<f64>> = (0..pop_size)
                .map(|target| {
                    let (r1, r2) = pick_two_distinct(&mut rng, pop_size, target);
                    let forced = rng.gen_range(0..dim);

                    (0..dim)
                        .map(|k| {
                            if k == forced || rng.gen::<f64>() < self.crossover {
                                let mutant =
                                    best[k] + factor * (population[r1][k] - population[r2][k]);
                                let (lo, hi) = bounds[k];
                                if mutant < lo || mutant > hi {
                                    // Resample out-of-bounds components uniformly.
                                    lo + rng.gen::<f64>() * (hi - lo)
                                } else {
                                    mutant
                                }
                            } else {
                                population[target][k]
                            }
                        })
                        .collect()
                })
                .collect();

            let trial_costs = self.evaluate(objective, &trials);

            for (i, (trial, cost)) in trials.into_iter().zip(trial_costs).enumerate() {
                if cost <= costs[i] {
                    population[i] = trial;
                    costs[i] = cost;
                }
            }

            converged = self.has_converged(&costs);
        }

        let best = best_index(&costs);
        log::debug!(
            "Differential evolution: dim={}, population={}, iterations={}, converged={}, cost={:.6e}",
            dim,
            pop_size,
            iterations,
            converged,
            costs[best]
        );

        Ok(Minimum {
            params: population[best].clone(),
            cost: costs[best],
            iterations,
            converged,
        })
    }
}

fn pick_two_distinct(rng: &mut StdRng, n: usize, exclude: usize) -> (usize, usize) {
    let mut a = rng.gen_range(0..n);
    while a == exclude {
        a = rng.gen_range(0..n);
    }
    let mut b = rng.gen_range(0..n);
    while b == exclude || b == a {
        b = rng.gen_range(0..n);
    }
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_minimizes_shifted_paraboloid() {
        let de = DifferentialEvolution::default();
        let objective = |p: &[f64]| (p[0] - 1.5).powi(2) + (p[1] + 0.25).powi(2);

        let result = de
            .minimize(&objective, &[(-5.0, 5.0), (-5.0, 5.0)], 7)
            .unwrap();

        assert_abs_diff_eq!(result.params[0], 1.5, epsilon = 1e-4);
        assert_abs_diff_eq!(result.params[1], -0.25, epsilon = 1e-4);
        assert!(result.cost < 1e-8);
    }

    #[test]
    fn test_same_seed_same_result() {
        let de = DifferentialEvolution {
            max_iterations: 30,
            ..Default::default()
        };
        let objective = |p: &[f64]| (p[0] * 3.0).sin() + p[0] * p[0] * 0.1;

        let a = de.minimize(&objective, &[(-4.0, 4.0)], 99).unwrap();
        let b = de.minimize(&objective, &[(-4.0, 4.0)], 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let objective = |p: &[f64]| (p[0] - 0.3).abs() + (p[1] - 0.7).powi(2);
        let bounds = [(0.0, 1.0), (0.0, 1.0)];

        let parallel = DifferentialEvolution::default()
            .minimize(&objective, &bounds, 3)
            .unwrap();
        let sequential = DifferentialEvolution {
            parallel: false,
            ..Default::default()
        }
        .minimize(&objective, &bounds, 3)
        .unwrap();

        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_respects_bounds_and_reports_pinned_parameter() {
        let de = DifferentialEvolution::default();
        // Unconstrained optimum at 10 lies outside the box.
        let objective = |p: &[f64]| (p[0] - 10.0).powi(2);
        let bounds = [(0.0, 2.0)];

        let result = de.minimize(&objective, &bounds, 1).unwrap();
        assert!(result.params[0] <= 2.0);
        assert_abs_diff_eq!(result.params[0], 2.0, epsilon = 1e-3);
        assert_eq!(result.parameters_at_bounds(&bounds, 1e-3), vec![0]);
    }

    #[test]
    fn test_degenerate_bound_is_fixed_parameter() {
        let de = DifferentialEvolution::default();
        let objective = |p: &[f64]| (p[0] - 1.0).powi(2) + p[1];
        let result = de.minimize(&objective, &[(0.0, 3.0), (4.0, 4.0)], 5).unwrap();
        assert_eq!(result.params[1], 4.0);
    }

    #[test]
    fn test_invalid_bounds() {
        let de = DifferentialEvolution::default();
        let objective = |_: &[f64]| 0.0;
        assert_eq!(
            de.minimize(&objective, &[], 0).unwrap_err(),
            OptimizeError::EmptyBounds
        );
        assert!(matches!(
            de.minimize(&objective, &[(1.0, 0.0)], 0),
            Err(OptimizeError::InvalidBound { index: 0, .. })
        ));
    }

    #[test]
    fn test_non_finite_objective() {
        let de = DifferentialEvolution::default();
        let objective = |_: &[f64]| f64::NAN;
        assert_eq!(
            de.minimize(&objective, &[(0.0, 1.0)], 0).unwrap_err(),
            OptimizeError::NonFiniteCost
        );
    }
}
