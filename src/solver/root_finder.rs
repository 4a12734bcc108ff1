#[cfg(feature = "gsl")]
use crate::solver::gsl::GslRootFinder;

use enum_dispatch::enum_dispatch;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt::Debug;

/// Restriction of the objective to a ray `x + α d`, `α >= 0`
///
/// Root finders look for a zero of [LineFunction::derivative], using
/// [LineFunction::second_derivative] as its derivative and [LineFunction::value] to compare
/// candidate steps.
pub trait LineFunction {
    fn value(&self, alpha: f64) -> f64;

    fn derivative(&self, alpha: f64) -> f64;

    fn second_derivative(&self, alpha: f64) -> f64;
}

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
pub enum RootFinderError {
    #[error("non-finite derivative at step {alpha}")]
    NonFinite { alpha: f64 },

    #[error("non-positive curvature at step {alpha}")]
    NonPositiveCurvature { alpha: f64 },

    #[error("iteration limit reached at step {alpha}")]
    MaxIterations { alpha: f64 },

    #[cfg(feature = "gsl")]
    #[error("GSL solver failed at step {alpha}")]
    Gsl { alpha: f64 },
}

/// Step found by a root finder
///
/// `alpha` is always finite and non-negative. When `error` is set the search stopped early and
/// `alpha` is the best step available at that point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RootSearch {
    pub alpha: f64,
    pub iterations: u32,
    /// Calls of any [LineFunction] method made by the search
    pub evaluations: u32,
    pub error: Option<RootFinderError>,
}

impl RootSearch {
    pub(super) fn converged(alpha: f64, iterations: u32) -> Self {
        Self {
            alpha,
            iterations,
            evaluations: 0,
            error: None,
        }
    }

    pub(super) fn failed(alpha: f64, iterations: u32, error: RootFinderError) -> Self {
        Self {
            alpha,
            iterations,
            evaluations: 0,
            error: Some(error),
        }
    }

    #[inline]
    pub fn is_converged(&self) -> bool {
        self.error.is_none()
    }
}

/// [LineFunction] wrapper counting the calls made through it
pub(super) struct Counted<'a, F> {
    f: &'a F,
    evaluations: Cell<u32>,
}

impl<F> Counted<'_, F> {
    fn tick(&self) {
        self.evaluations.set(self.evaluations.get().saturating_add(1));
    }
}

impl<F: LineFunction> LineFunction for Counted<'_, F> {
    fn value(&self, alpha: f64) -> f64 {
        self.tick();
        self.f.value(alpha)
    }

    fn derivative(&self, alpha: f64) -> f64 {
        self.tick();
        self.f.derivative(alpha)
    }

    fn second_derivative(&self, alpha: f64) -> f64 {
        self.tick();
        self.f.second_derivative(alpha)
    }
}

/// Run `search` on `f` and store the number of calls it made in the result
pub(super) fn count_evaluations<'a, F, S>(f: &'a F, search: S) -> RootSearch
where
    F: LineFunction,
    S: FnOnce(&Counted<'a, F>) -> RootSearch,
{
    let counted = Counted {
        f,
        evaluations: Cell::new(0),
    };
    let mut result = search(&counted);
    result.evaluations = counted.evaluations.get();
    result
}

#[enum_dispatch]
pub trait ScalarRootFinder: Clone + Debug {
    /// Find a stationary point on `[0, ∞)`
    fn find_unbounded<F: LineFunction>(&self, f: &F) -> RootSearch;

    /// Find a stationary point on `[0, bound]`
    fn find_bounded<F: LineFunction>(&self, f: &F, bound: f64) -> RootSearch;
}

/// Root finder used by the line searches of [PcgPoissonSolver](crate::PcgPoissonSolver)
#[enum_dispatch(ScalarRootFinder)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[non_exhaustive]
pub enum RootFinderAlgorithm {
    Newton(NewtonRootFinder),
    Brent(BrentRootFinder),
    #[cfg(feature = "gsl")]
    Gsl(GslRootFinder),
}

impl RootFinderAlgorithm {
    pub fn newton(tolerance: f64, max_iterations: u32) -> Self {
        NewtonRootFinder::new(tolerance, max_iterations).into()
    }

    pub fn brent(tolerance: f64, max_iterations: u32) -> Self {
        BrentRootFinder::new(tolerance, max_iterations).into()
    }

    /// Requires `gsl` Cargo feature
    #[cfg(feature = "gsl")]
    pub fn gsl(tolerance: f64, max_iterations: u32) -> Self {
        GslRootFinder::new(tolerance, max_iterations).into()
    }
}

pub(super) fn assert_settings(tolerance: f64, max_iterations: u32) {
    assert!(
        tolerance.is_finite() && tolerance > 0.0,
        "tolerance must be positive and finite"
    );
    assert!(max_iterations > 0, "max_iterations must be positive");
}

/// Newton iteration on the derivative of the line function
///
/// Starts from `α = 0`. Negative iterates are clamped to zero, the objective is treated as flat
/// there because negative steps are infeasible. Stops once the step changes by less than
/// `tolerance`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "Newton")]
pub struct NewtonRootFinder {
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl NewtonRootFinder {
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

    fn iterate<F: LineFunction>(&self, f: &F, upper: f64) -> RootSearch {
        let mut alpha = 0.0;
        for iteration in 1..=self.max_iterations {
            let d1 = f.derivative(alpha);
            let d2 = f.second_derivative(alpha);
            if !(d1.is_finite() && d2.is_finite()) {
                return RootSearch::failed(alpha, iteration, RootFinderError::NonFinite { alpha });
            }
            if d2 <= 0.0 {
                return RootSearch::failed(
                    alpha,
                    iteration,
                    RootFinderError::NonPositiveCurvature { alpha },
                );
            }
            let next = (alpha - d1 / d2).clamp(0.0, upper);
            if !next.is_finite() {
                return RootSearch::failed(alpha, iteration, RootFinderError::NonFinite { alpha });
            }
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
}

impl Default for NewtonRootFinder {
    fn default() -> Self {
        Self::new(Self::default_tolerance(), Self::default_max_iterations())
    }
}

impl ScalarRootFinder for NewtonRootFinder {
    fn find_unbounded<F: LineFunction>(&self, f: &F) -> RootSearch {
        count_evaluations(f, |f| self.iterate(f, f64::MAX))
    }

    fn find_bounded<F: LineFunction>(&self, f: &F, bound: f64) -> RootSearch {
        assert!(bound >= 0.0, "bound must be non-negative");
        count_evaluations(f, |f| self.iterate(f, bound))
    }
}

/// Derivatives at both ends of `[0, bound]` when they bracket a root
///
/// Otherwise the search is already decided: a monotonic function gives the endpoint with the
/// lower value.
pub(super) fn bracket<F: LineFunction>(f: &F, bound: f64) -> Result<(f64, f64), RootSearch> {
    let f_lower = f.derivative(0.0);
    let f_upper = f.derivative(bound);
    if f_lower.is_nan() || f_upper.is_nan() {
        return Err(RootSearch::failed(
            0.0,
            0,
            RootFinderError::NonFinite { alpha: 0.0 },
        ));
    }
    if f_lower == 0.0 || bound == 0.0 {
        return Err(RootSearch::converged(0.0, 0));
    }
    if f_upper == 0.0 {
        return Err(RootSearch::converged(bound, 0));
    }
    if f_lower.signum() == f_upper.signum() {
        let alpha = if f.value(bound) < f.value(0.0) { bound } else { 0.0 };
        return Err(RootSearch::converged(alpha, 0));
    }
    Ok((f_lower, f_upper))
}

/// Brent's method on the derivative of the line function
///
/// If the derivative has the same sign at both ends of the interval the function is monotonic
/// there and the endpoint with the lower value is returned without iterating. Unbounded searches
/// first double the interval until the derivative changes sign.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "Brent")]
pub struct BrentRootFinder {
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl BrentRootFinder {
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

    fn brent<F: LineFunction>(
        &self,
        f: &F,
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
    ) -> RootSearch {
        let (mut a, mut b, mut c) = (lower, upper, upper);
        let (mut fa, mut fb) = (f_lower, f_upper);
        let mut fc = fb;
        let mut d = b - a;
        let mut e = d;
        for iteration in 1..=self.max_iterations {
            if (fb > 0.0 && fc > 0.0) || (fb < 0.0 && fc < 0.0) {
                c = a;
                fc = fa;
                d = b - a;
                e = d;
            }
            if fc.abs() < fb.abs() {
                a = b;
                b = c;
                c = a;
                fa = fb;
                fb = fc;
                fc = fa;
            }
            let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * self.tolerance;
            let xm = 0.5 * (c - b);
            if xm.abs() <= tol1 || fb == 0.0 {
                return RootSearch::converged(b.max(0.0), iteration);
            }
            if e.abs() >= tol1 && fa.abs() > fb.abs() {
                let s = fb / fa;
                let (mut p, mut q) = if a == c {
                    (2.0 * xm * s, 1.0 - s)
                } else {
                    let q = fa / fc;
                    let r = fb / fc;
                    (
                        s * (2.0 * xm * q * (q - r) - (b - a) * (r - 1.0)),
                        (q - 1.0) * (r - 1.0) * (s - 1.0),
                    )
                };
                if p > 0.0 {
                    q = -q;
                }
                p = p.abs();
                let min1 = 3.0 * xm * q - (tol1 * q).abs();
                let min2 = (e * q).abs();
                // NaN from infinite endpoints fails the comparison and falls back to bisection
                if 2.0 * p < min1.min(min2) {
                    e = d;
                    d = p / q;
                } else {
                    d = xm;
                    e = d;
                }
            } else {
                d = xm;
                e = d;
            }
            a = b;
            fa = fb;
            b += if d.abs() > tol1 { d } else { tol1.copysign(xm) };
            fb = f.derivative(b);
            if fb.is_nan() {
                return RootSearch::failed(
                    a.max(0.0),
                    iteration,
                    RootFinderError::NonFinite { alpha: b },
                );
            }
        }
        RootSearch::failed(
            b.max(0.0),
            self.max_iterations,
            RootFinderError::MaxIterations { alpha: b },
        )
    }
}

impl Default for BrentRootFinder {
    fn default() -> Self {
        Self::new(Self::default_tolerance(), Self::default_max_iterations())
    }
}

impl BrentRootFinder {
    fn unbounded<F: LineFunction>(&self, f: &F) -> RootSearch {
        let f_lower = f.derivative(0.0);
        if f_lower.is_nan() {
            return RootSearch::failed(0.0, 0, RootFinderError::NonFinite { alpha: 0.0 });
        }
        if f_lower >= 0.0 {
            return RootSearch::converged(0.0, 0);
        }
        let mut upper = 1.0;
        for _ in 0..self.max_iterations {
            let f_upper = f.derivative(upper);
            if f_upper.is_nan() {
                return RootSearch::failed(
                    0.0,
                    0,
                    RootFinderError::NonFinite { alpha: upper },
                );
            }
            if f_upper >= 0.0 {
                return self.brent(f, 0.0, upper, f_lower, f_upper);
            }
            upper *= 2.0;
        }
        RootSearch::failed(
            upper,
            self.max_iterations,
            RootFinderError::MaxIterations { alpha: upper },
        )
    }

    fn bounded<F: LineFunction>(&self, f: &F, bound: f64) -> RootSearch {
        match bracket(f, bound) {
            Ok((f_lower, f_upper)) => self.brent(f, 0.0, bound, f_lower, f_upper),
            Err(search) => search,
        }
    }
}

impl ScalarRootFinder for BrentRootFinder {
    fn find_unbounded<F: LineFunction>(&self, f: &F) -> RootSearch {
        count_evaluations(f, |f| self.unbounded(f))
    }

    fn find_bounded<F: LineFunction>(&self, f: &F, bound: f64) -> RootSearch {
        assert!(bound >= 0.0, "bound must be non-negative");
        count_evaluations(f, |f| self.bounded(f, bound))
    }
}
