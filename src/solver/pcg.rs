use crate::kahan::{KahanSum, kahan_sum};
use crate::solver::line_search::PoissonLine;
use crate::solver::root_finder::{
    BrentRootFinder, LineFunction, NewtonRootFinder, RootFinderAlgorithm, RootSearch,
    ScalarRootFinder,
};
use crate::sparse::SparseMatrix;

use ndarray::{Array1, ArrayView1, Zip};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Settings of [PcgPoissonSolver]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SolverConfig {
    /// Convergence threshold on the squared norm of the truncated gradient
    pub tolerance: f64,
    /// Convergence is not checked before this number of iterations
    pub min_iterations: u32,
    pub max_iterations: u32,
    /// Offset added to the energies when preconditioning, lets zero energies grow again
    pub energy_epsilon: f64,
    pub unbounded_root_finder: RootFinderAlgorithm,
    pub bounded_root_finder: RootFinderAlgorithm,
}

impl SolverConfig {
    pub fn new(
        tolerance: f64,
        min_iterations: u32,
        max_iterations: u32,
        energy_epsilon: f64,
    ) -> Self {
        assert!(
            tolerance.is_finite() && tolerance >= 0.0,
            "tolerance must be non-negative and finite"
        );
        assert!(
            energy_epsilon.is_finite() && energy_epsilon >= 0.0,
            "energy_epsilon must be non-negative and finite"
        );
        Self {
            tolerance,
            min_iterations,
            max_iterations,
            energy_epsilon,
            unbounded_root_finder: Self::default_unbounded_root_finder(),
            bounded_root_finder: Self::default_bounded_root_finder(),
        }
    }

    pub fn with_root_finders(
        mut self,
        unbounded: RootFinderAlgorithm,
        bounded: RootFinderAlgorithm,
    ) -> Self {
        self.unbounded_root_finder = unbounded;
        self.bounded_root_finder = bounded;
        self
    }

    #[inline]
    pub fn default_tolerance() -> f64 {
        1e-6
    }

    #[inline]
    pub fn default_min_iterations() -> u32 {
        0
    }

    #[inline]
    pub fn default_max_iterations() -> u32 {
        100
    }

    #[inline]
    pub fn default_energy_epsilon() -> f64 {
        1e-3
    }

    #[inline]
    pub fn default_unbounded_root_finder() -> RootFinderAlgorithm {
        NewtonRootFinder::default().into()
    }

    #[inline]
    pub fn default_bounded_root_finder() -> RootFinderAlgorithm {
        BrentRootFinder::default().into()
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self::new(
            Self::default_tolerance(),
            Self::default_min_iterations(),
            Self::default_max_iterations(),
            Self::default_energy_epsilon(),
        )
    }
}

/// Reason the solver stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum SolveStatus {
    /// Truncated gradient fell below the tolerance
    Converged,
    /// Two consecutive steps did not move the solution
    Stalled,
    /// Iteration limit reached, the result is the last iterate
    MaxIterations,
    /// Nothing to solve for
    NoSources,
}

/// Snapshot passed to the per-iteration callback, taken before the iteration's update
#[derive(Clone, Debug)]
pub struct IterationState<'a> {
    /// One-based iteration number
    pub iteration: u32,
    /// Penalized negative log-likelihood at `energies`
    pub objective: f64,
    /// Squared norm of the gradient with the components blocked by `x = 0` removed
    pub gradient_norm2: f64,
    pub energies: ArrayView1<'a, f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SolveResult {
    pub energies: Array1<f64>,
    /// Number of gradient evaluations
    pub iterations: u32,
    pub objective: f64,
    pub gradient_norm2: f64,
    pub status: SolveStatus,
}

/// Penalized Poisson negative log-likelihood `Σ(μ - d ln μ) + xᵗQx` with `μ = Bx + b`
pub fn penalized_negative_log_likelihood(
    basis: &SparseMatrix,
    penalty: Option<&SparseMatrix>,
    x: ArrayView1<f64>,
    data: ArrayView1<f64>,
    noise: ArrayView1<f64>,
) -> f64 {
    let mut mu = noise.to_owned();
    basis.mul_vec_acc(mu.view_mut(), 1.0, x);
    poisson_term(mu.view(), data) + penalty.map_or(0.0, |q| q.bilinear(x, x))
}

fn poisson_term(mu: ArrayView1<f64>, data: ArrayView1<f64>) -> f64 {
    let mut sum = KahanSum::new();
    Zip::from(&mu).and(&data).for_each(|&mu, &data| {
        sum += if data > 0.0 { mu - data * mu.ln() } else { mu };
    });
    sum.sum()
}

/// Objective, gradient and related quantities at a single point
struct Evaluation {
    mu: Array1<f64>,
    /// `Bᵗ[(d - μ)/μ] - 2Qx`, minus the gradient of the objective
    gradient: Array1<f64>,
    objective: f64,
    gradient_norm2: f64,
}

/// Projected, preconditioned non-linear conjugate-gradient minimizer of the penalized Poisson
/// negative log-likelihood with non-negative energies
///
/// Every iteration:
/// 1. evaluates `μ = Bx + b` and the gradient `g = Bᵗ[(d - μ)/μ] - 2Qx`,
/// 2. stops if the squared norm of the truncated gradient (components with `x_i = 0` and
///    `g_i <= 0` removed) is below the tolerance,
/// 3. preconditions `v_i = g_i (x_i + ε) / Σ_k B_ki`,
/// 4. builds the Polak–Ribière conjugate direction, falling back to `g` if it is not a descent
///    direction,
/// 5. minimizes exactly along the direction up to the step where an expectation turns negative,
/// 6. truncates negative energies and minimizes again along the truncated displacement on
///    `[0, 1]`.
///
/// The solver never fails: hitting an iteration limit returns the last iterate.
#[derive(Clone, Debug)]
pub struct PcgPoissonSolver {
    config: SolverConfig,
}

impl PcgPoissonSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Constant energies whose total expectation matches the noise-subtracted charge, or zero
    pub fn initial_guess(
        basis: &SparseMatrix,
        data: ArrayView1<f64>,
        noise: ArrayView1<f64>,
    ) -> Array1<f64> {
        let total_support = kahan_sum(basis.col_sums());
        let excess = kahan_sum(data.iter().copied())
            - kahan_sum(noise.iter().copied());
        let energy = if total_support > 0.0 {
            (excess / total_support).max(0.0)
        } else {
            0.0
        };
        Array1::from_elem(basis.ncols(), energy)
    }

    pub fn solve(
        &self,
        basis: &SparseMatrix,
        penalty: Option<&SparseMatrix>,
        data: ArrayView1<f64>,
        noise: ArrayView1<f64>,
    ) -> SolveResult {
        self.solve_with_callback(basis, penalty, data, noise, |_| {})
    }

    /// Same as [PcgPoissonSolver::solve], calling `callback` at the start of every iteration
    pub fn solve_with_callback<C>(
        &self,
        basis: &SparseMatrix,
        penalty: Option<&SparseMatrix>,
        data: ArrayView1<f64>,
        noise: ArrayView1<f64>,
        mut callback: C,
    ) -> SolveResult
    where
        C: FnMut(&IterationState),
    {
        let (nbins, nsources) = (basis.nrows(), basis.ncols());
        assert_eq!(data.len(), nbins, "data length must match basis rows");
        assert_eq!(noise.len(), nbins, "noise length must match basis rows");
        if let Some(q) = penalty {
            assert_eq!(q.nrows(), nsources, "penalty must be square in the number of sources");
            assert_eq!(q.ncols(), nsources, "penalty must be square in the number of sources");
        }

        if nsources == 0 {
            return SolveResult {
                energies: Array1::zeros(0),
                iterations: 0,
                objective: poisson_term(noise, data),
                gradient_norm2: 0.0,
                status: SolveStatus::NoSources,
            };
        }

        let support = basis
            .col_sums()
            .mapv_into(|s| if s > 0.0 { s } else { 1.0 });
        let mut x = Self::initial_guess(basis, data, noise);
        let mut previous: Option<(Array1<f64>, Array1<f64>, Array1<f64>)> = None;
        let mut zero_steps = 0;
        let mut iterations = 0;
        let mut status = SolveStatus::MaxIterations;

        for iteration in 1..=self.config.max_iterations {
            iterations = iteration;
            let eval = self.evaluate(basis, penalty, x.view(), data, noise);
            trace!(
                iteration,
                objective = eval.objective,
                gradient_norm2 = eval.gradient_norm2,
                "PCG iteration"
            );
            callback(&IterationState {
                iteration,
                objective: eval.objective,
                gradient_norm2: eval.gradient_norm2,
                energies: x.view(),
            });
            if iteration > self.config.min_iterations && eval.gradient_norm2 < self.config.tolerance
            {
                status = SolveStatus::Converged;
                break;
            }

            let g = eval.gradient;
            let v = Zip::from(&g)
                .and(&x)
                .and(&support)
                .map_collect(|&g, &x, &s| g * (x + self.config.energy_epsilon) / s);

            let mut direction = match &previous {
                Some((last_g, last_v, last_direction)) => {
                    let beta = polak_ribiere(g.view(), v.view(), last_g.view(), last_v.view());
                    beta * last_direction + &v
                }
                None => v.clone(),
            };
            // The slope of the objective along the direction is -gᵗd
            let ascent = g.dot(&direction);
            if ascent.is_nan() || ascent <= 0.0 {
                direction = g.clone();
            }

            let step = self.line_step(basis, penalty, &eval.mu, x.view(), direction.view(), data);
            let x_next = Zip::from(&x)
                .and(&step)
                .map_collect(|&x, &s| (x + s).max(0.0));

            if x_next == x {
                zero_steps += 1;
            } else {
                zero_steps = 0;
            }
            previous = Some((g, v, direction));
            x = x_next;
            if zero_steps >= 2 {
                status = SolveStatus::Stalled;
                break;
            }
        }

        let eval = self.evaluate(basis, penalty, x.view(), data, noise);
        match status {
            SolveStatus::MaxIterations => warn!(
                iterations,
                gradient_norm2 = eval.gradient_norm2,
                "PCG solver reached the iteration limit"
            ),
            _ => debug!(iterations, ?status, objective = eval.objective, "PCG solver finished"),
        }
        SolveResult {
            energies: x,
            iterations,
            objective: eval.objective,
            gradient_norm2: eval.gradient_norm2,
            status,
        }
    }

    fn evaluate(
        &self,
        basis: &SparseMatrix,
        penalty: Option<&SparseMatrix>,
        x: ArrayView1<f64>,
        data: ArrayView1<f64>,
        noise: ArrayView1<f64>,
    ) -> Evaluation {
        let mut mu = noise.to_owned();
        basis.mul_vec_acc(mu.view_mut(), 1.0, x);
        assert!(
            mu.iter().all(|&mu| mu > 0.0),
            "expectations must be positive, check that noise is positive"
        );
        let ratio = Zip::from(&data)
            .and(&mu)
            .map_collect(|&data, &mu| (data - mu) / mu);
        let mut gradient = basis.tr_mul_vec(ratio.view());
        let mut objective = poisson_term(mu.view(), data);
        if let Some(q) = penalty {
            q.mul_vec_acc(gradient.view_mut(), -2.0, x);
            objective += q.bilinear(x, x);
        }
        let gradient_norm2 = Zip::from(&gradient)
            .and(&x)
            .fold(KahanSum::new(), |mut acc, &g, &x| {
                if !(x == 0.0 && g <= 0.0) {
                    acc += g * g;
                }
                acc
            })
            .sum();
        Evaluation {
            mu,
            gradient,
            objective,
            gradient_norm2,
        }
    }

    /// Two-stage update: exact search along `direction`, truncation, and a bounded search along
    /// the truncated displacement. Returns the displacement to add to `x`.
    fn line_step(
        &self,
        basis: &SparseMatrix,
        penalty: Option<&SparseMatrix>,
        mu: &Array1<f64>,
        x: ArrayView1<f64>,
        direction: ArrayView1<f64>,
        data: ArrayView1<f64>,
    ) -> Array1<f64> {
        let w = basis.mul_vec(direction);
        let line = PoissonLine::new(mu.view(), w.view(), data.view(), penalty, x, direction);
        let search = line.minimize(
            &self.config.unbounded_root_finder,
            &self.config.bounded_root_finder,
        );
        log_failure("direction", &search);

        let displacement = Zip::from(&x)
            .and(&direction)
            .map_collect(|&x, &d| (x + search.alpha * d).max(0.0) - x);
        let w = basis.mul_vec(displacement.view());
        let line = PoissonLine::new(
            mu.view(),
            w.view(),
            data.view(),
            penalty,
            x,
            displacement.view(),
        );
        let search = self.config.bounded_root_finder.find_bounded(&line, 1.0);
        log_failure("truncated displacement", &search);

        let alpha = if line.value(search.alpha) <= line.value(0.0) {
            search.alpha
        } else {
            0.0
        };
        displacement * alpha
    }
}

impl Default for PcgPoissonSolver {
    fn default() -> Self {
        Self::new(SolverConfig::default())
    }
}

fn polak_ribiere(
    g: ArrayView1<f64>,
    v: ArrayView1<f64>,
    last_g: ArrayView1<f64>,
    last_v: ArrayView1<f64>,
) -> f64 {
    let denominator = last_g.dot(&last_v);
    let numerator = g.dot(&(&v - &last_v));
    let beta = numerator / denominator;
    if beta.is_finite() { beta.max(0.0) } else { 0.0 }
}

fn log_failure(stage: &str, search: &RootSearch) {
    if let Some(error) = search.error {
        debug!(stage, alpha = search.alpha, %error, "line search stopped early");
    }
}
