use crate::solver::root_finder::{
    LineFunction, RootFinderError, RootSearch, ScalarRootFinder, assert_settings, bracket,
    count_evaluations,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

type ErrorHandler = fn(&str, &str, u32, rgsl::Value);

/// Turns the GSL error handler off and puts the previous one back when dropped
///
/// The default handler aborts the process, failures of a single line search must not.
struct ErrorHandlerOff {
    previous: Option<ErrorHandler>,
}

impl ErrorHandlerOff {
    fn new() -> Self {
        Self {
            previous: rgsl::error::set_error_handler_off(),
        }
    }
}

impl Drop for ErrorHandlerOff {
    fn drop(&mut self) {
        rgsl::error::set_error_handler(self.previous);
    }
}

/// Root finders of the GNU Scientific Library
///
/// Bounded searches run GSL's Brent solver on the derivative of the line function, unbounded
/// searches run GSL's Newton solver using the second derivative. The search stops when the
/// bracket or the Newton step gets narrower than `tolerance`. GSL errors are reported through
/// [RootSearch::error]. The GSL error handler is global, it is switched off for the duration
/// of every search and restored afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "Gsl")]
pub struct GslRootFinder {
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl GslRootFinder {
    pub fn new(tolerance: f64, max_iterations: u32) -> Self {
        assert_settings(tolerance, max_iterations);
        Self {
            tolerance,
            max_iterations,
        }
    }

    #[inline]
    pub fn default_tolerance() -> f64 {
        1e-3
    }

    #[inline]
    pub fn default_max_iterations() -> u32 {
        100
    }

    fn newton<F: LineFunction>(&self, f: &F) -> RootSearch {
        let d0 = f.derivative(0.0);
        if d0.is_nan() {
            return RootSearch::failed(0.0, 0, RootFinderError::NonFinite { alpha: 0.0 });
        }
        if d0 >= 0.0 {
            return RootSearch::converged(0.0, 0);
        }

        let Some(mut solver) = rgsl::RootFdfSolver::new(rgsl::RootFdfSolverType::newton()) else {
            return RootSearch::failed(0.0, 0, RootFinderError::Gsl { alpha: 0.0 });
        };
        let _handler = ErrorHandlerOff::new();
        if let Err(status) = solver.set(
            |alpha| f.derivative(alpha),
            |alpha| f.second_derivative(alpha),
            |alpha, d1, d2| {
                *d1 = f.derivative(alpha);
                *d2 = f.second_derivative(alpha);
            },
            0.0,
        ) {
            debug!(?status, "GSL Newton solver rejected the start point");
            return RootSearch::failed(0.0, 0, RootFinderError::Gsl { alpha: 0.0 });
        }

        let mut alpha = 0.0;
        for iteration in 1..=self.max_iterations {
            if let Err(status) = solver.iterate() {
                debug!(?status, alpha, "GSL Newton iteration failed");
                return RootSearch::failed(alpha, iteration, RootFinderError::Gsl { alpha });
            }
            let next = solver.root();
            if !next.is_finite() {
                return RootSearch::failed(alpha, iteration, RootFinderError::NonFinite { alpha });
            }
            // negative steps are infeasible, the objective is flat there
            let next = next.max(0.0);
            let delta = (next - alpha).abs();
            alpha = next;
            if delta < self.tolerance {
                return RootSearch::converged(alpha, iteration);
            }
        }
        RootSearch::failed(
            alpha,
            self.max_iterations,
            RootFinderError::MaxIterations { alpha },
        )
    }

    fn brent<F: LineFunction>(&self, f: &F, bound: f64) -> RootSearch {
        if let Err(search) = bracket(f, bound) {
            return search;
        }

        let Some(mut solver) = rgsl::RootFSolver::new(rgsl::RootFSolverType::brent()) else {
            return RootSearch::failed(0.0, 0, RootFinderError::Gsl { alpha: 0.0 });
        };
        let _handler = ErrorHandlerOff::new();
        if let Err(status) = solver.set(|alpha| f.derivative(alpha), 0.0, bound) {
            debug!(?status, bound, "GSL Brent solver rejected the bracket");
            return RootSearch::failed(0.0, 0, RootFinderError::Gsl { alpha: 0.0 });
        }

        let mut alpha = 0.0;
        for iteration in 1..=self.max_iterations {
            if let Err(status) = solver.iterate() {
                debug!(?status, alpha, "GSL Brent iteration failed");
                return RootSearch::failed(alpha, iteration, RootFinderError::Gsl { alpha });
            }
            alpha = solver.root().clamp(0.0, bound);
            if solver.x_upper() - solver.x_lower() < self.tolerance {
                return RootSearch::converged(alpha, iteration);
            }
        }
        RootSearch::failed(
            alpha,
            self.max_iterations,
            RootFinderError::MaxIterations { alpha },
        )
    }
}

impl Default for GslRootFinder {
    fn default() -> Self {
        Self::new(Self::default_tolerance(), Self::default_max_iterations())
    }
}

impl ScalarRootFinder for GslRootFinder {
    fn find_unbounded<F: LineFunction>(&self, f: &F) -> RootSearch {
        count_evaluations(f, |f| self.newton(f))
    }

    fn find_bounded<F: LineFunction>(&self, f: &F, bound: f64) -> RootSearch {
        assert!(bound >= 0.0, "bound must be non-negative");
        count_evaluations(f, |f| self.brent(f, bound))
    }
}
