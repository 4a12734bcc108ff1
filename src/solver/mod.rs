//! Non-negative Poisson unfolding solver
//!
//! [PcgPoissonSolver] minimizes the penalized negative log-likelihood
//!
//! ```text
//! f(x) = Σ_i [μ_i - d_i ln μ_i] + xᵗ Q x,    μ = B x + b,    x >= 0
//! ```
//!
//! where `B` is the basis (response) matrix, `b` the expected noise, `d` the observed counts and
//! `Q` an optional quadratic penalty, see [crate::regularization]. Line searches along the
//! conjugate directions are solved exactly by a [ScalarRootFinder] applied to the derivative of
//! the objective restricted to the search ray. [GslRootFinder] (requires `gsl` Cargo feature)
//! wraps the root solvers of the GNU Scientific Library.

#[cfg(feature = "gsl")]
pub mod gsl;
#[cfg(feature = "gsl")]
pub use gsl::GslRootFinder;

mod line_search;

pub mod pcg;
pub use pcg::{
    IterationState, PcgPoissonSolver, SolveResult, SolveStatus, SolverConfig,
    penalized_negative_log_likelihood,
};

pub mod root_finder;
pub use root_finder::{
    BrentRootFinder, LineFunction, NewtonRootFinder, RootFinderAlgorithm, RootFinderError,
    RootSearch, ScalarRootFinder,
};
