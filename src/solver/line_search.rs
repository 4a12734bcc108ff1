use crate::kahan::KahanSum;
use crate::solver::root_finder::{LineFunction, RootSearch, ScalarRootFinder};
use crate::sparse::SparseMatrix;

use ndarray::{ArrayView1, Zip};

/// Distance kept from the point where an expectation reaches zero
const BOUND_SHRINK: f64 = 1e-9;

/// Penalized Poisson negative log-likelihood along `x + α d`
///
/// With `μ = B x + b` and `w = B d` the expectation along the ray is `μ + α w`, and the quadratic
/// penalty expands into `xᵗQx + 2α xᵗQd + α² dᵗQd`. Negative steps are infeasible: the function is
/// flat there.
pub(crate) struct PoissonLine<'a> {
    mu: ArrayView1<'a, f64>,
    w: ArrayView1<'a, f64>,
    data: ArrayView1<'a, f64>,
    x_q_x: f64,
    x_q_d: f64,
    d_q_d: f64,
}

impl<'a> PoissonLine<'a> {
    pub(crate) fn new(
        mu: ArrayView1<'a, f64>,
        w: ArrayView1<'a, f64>,
        data: ArrayView1<'a, f64>,
        penalty: Option<&SparseMatrix>,
        x: ArrayView1<f64>,
        d: ArrayView1<f64>,
    ) -> Self {
        let (x_q_x, x_q_d, d_q_d) = match penalty {
            Some(q) => (q.bilinear(x, x), q.bilinear(x, d), q.bilinear(d, d)),
            None => (0.0, 0.0, 0.0),
        };
        Self {
            mu,
            w,
            data,
            x_q_x,
            x_q_d,
            d_q_d,
        }
    }

    /// Largest step keeping every expectation non-negative, `None` if there is no such limit
    pub(crate) fn max_step(&self) -> Option<f64> {
        Zip::from(&self.mu)
            .and(&self.w)
            .fold(None, |acc: Option<f64>, &mu, &w| {
                if w < 0.0 {
                    let step = -mu / w;
                    Some(acc.map_or(step, |acc| acc.min(step)))
                } else {
                    acc
                }
            })
    }

    /// Exact minimizer along the ray
    ///
    /// The bounded root finder is used when some expectation would turn negative, the unbounded
    /// one otherwise.
    pub(crate) fn minimize<U, B>(&self, unbounded: &U, bounded: &B) -> RootSearch
    where
        U: ScalarRootFinder,
        B: ScalarRootFinder,
    {
        match self.max_step() {
            Some(max_step) => bounded.find_bounded(self, max_step * (1.0 - BOUND_SHRINK)),
            None => unbounded.find_unbounded(self),
        }
    }

    fn penalty(&self, alpha: f64) -> f64 {
        self.x_q_x + 2.0 * alpha * self.x_q_d + alpha * alpha * self.d_q_d
    }
}

impl LineFunction for PoissonLine<'_> {
    fn value(&self, alpha: f64) -> f64 {
        let alpha = alpha.max(0.0);
        let mut sum = KahanSum::new();
        Zip::from(&self.mu)
            .and(&self.w)
            .and(&self.data)
            .for_each(|&mu, &w, &data| {
                let mu = mu + alpha * w;
                sum += if data > 0.0 {
                    if mu > 0.0 {
                        mu - data * mu.ln()
                    } else {
                        f64::INFINITY
                    }
                } else {
                    mu
                };
            });
        sum.sum() + self.penalty(alpha)
    }

    fn derivative(&self, alpha: f64) -> f64 {
        if alpha < 0.0 {
            return 0.0;
        }
        let mut sum = KahanSum::new();
        Zip::from(&self.mu)
            .and(&self.w)
            .and(&self.data)
            .for_each(|&mu, &w, &data| {
                if w != 0.0 {
                    sum += w * (1.0 - data / (mu + alpha * w));
                }
            });
        sum.sum() + 2.0 * (self.x_q_d + alpha * self.d_q_d)
    }

    fn second_derivative(&self, alpha: f64) -> f64 {
        if alpha < 0.0 {
            return 0.0;
        }
        let mut sum = KahanSum::new();
        Zip::from(&self.mu)
            .and(&self.w)
            .and(&self.data)
            .for_each(|&mu, &w, &data| {
                if w != 0.0 && data > 0.0 {
                    let mu = mu + alpha * w;
                    sum += data * w * w / (mu * mu);
                }
            });
        sum.sum() + 2.0 * self.d_q_d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::solver::root_finder::{BrentRootFinder, NewtonRootFinder};

    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn derivatives_match_finite_differences() {
        let mu = array![1.0, 2.0, 0.5];
        let w = array![0.5, -0.3, 1.0];
        let data = array![3.0, 0.0, 2.0];
        let q = SparseMatrix::from_dense(&array![[1.0, -1.0], [-1.0, 1.0]]).unwrap();
        let x = array![1.0, 0.5];
        let d = array![0.2, -0.4];
        let line = PoissonLine::new(mu.view(), w.view(), data.view(), Some(&q), x.view(), d.view());

        let alpha = 0.7;
        let h = 1e-6;
        assert_abs_diff_eq!(
            line.derivative(alpha),
            (line.value(alpha + h) - line.value(alpha - h)) / (2.0 * h),
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            line.second_derivative(alpha),
            (line.derivative(alpha + h) - line.derivative(alpha - h)) / (2.0 * h),
            epsilon = 1e-6
        );
    }

    #[test]
    fn flat_below_zero() {
        let mu = array![1.0];
        let w = array![1.0];
        let data = array![5.0];
        let x = array![1.0];
        let line = PoissonLine::new(mu.view(), w.view(), data.view(), None, x.view(), x.view());
        assert_eq!(line.value(-1.0), line.value(0.0));
        assert_eq!(line.derivative(-1.0), 0.0);
        assert_eq!(line.second_derivative(-1.0), 0.0);
    }

    #[test]
    fn max_step() {
        let mu = array![1.0, 2.0, 3.0];
        let data = array![1.0, 1.0, 1.0];
        let x = array![0.0];

        let w = array![0.5, -1.0, -6.0];
        let line = PoissonLine::new(mu.view(), w.view(), data.view(), None, x.view(), x.view());
        assert_eq!(line.max_step(), Some(0.5));

        let w = array![0.5, 0.0, 1.0];
        let line = PoissonLine::new(mu.view(), w.view(), data.view(), None, x.view(), x.view());
        assert_eq!(line.max_step(), None);
    }

    #[test]
    fn bounded_minimum_stays_inside() {
        // μ(α) = 1 - α, a single bin observing 2 counts: the minimum is on the boundary side
        let mu = array![1.0, 1.0];
        let w = array![-1.0, 0.0];
        let data = array![0.0, 2.0];
        let x = array![0.0];
        let line = PoissonLine::new(mu.view(), w.view(), data.view(), None, x.view(), x.view());
        let search = line.minimize(&NewtonRootFinder::default(), &BrentRootFinder::default());
        assert!(search.alpha <= 1.0);
        assert!(line.value(search.alpha) <= line.value(0.0));
    }
}
