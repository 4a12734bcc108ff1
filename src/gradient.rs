//! Likelihood gradient with respect to the geometric parameters of the sources
//!
//! The energies are held at the solution of the unfolding. There the likelihood is stationary in
//! the energies, so the chain-rule terms through `∂E/∂θ` vanish and the profile-likelihood
//! gradient is the partial derivative at fixed energies:
//!
//! ```text
//! ∂ ln L / ∂θ_jk = Σ_i (d_i - μ_i) / μ_i · x_j ∂B_ij/∂θ_jk
//! ```
//!
//! The penalty does not depend on the geometry and does not contribute.

use crate::error::MillipedeError;
use crate::kahan::KahanSum;
use crate::sparse::SparseMatrix;

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

/// Derivatives of the basis matrix with respect to per-source parameters
///
/// Column `j * nparams + k` holds `∂B[:, j] / ∂θ_jk`, the derivative of source `j`'s light yield
/// with respect to its `k`-th geometric parameter (position, time, direction, ...).
#[derive(Clone, Debug)]
pub struct BasisGradient {
    matrix: SparseMatrix,
    nsources: usize,
    nparams: usize,
}

impl BasisGradient {
    pub fn new(
        matrix: SparseMatrix,
        nsources: usize,
        nparams: usize,
    ) -> Result<Self, MillipedeError> {
        if matrix.ncols() != nsources * nparams {
            return Err(MillipedeError::GradientShapeMismatch {
                actual: matrix.ncols(),
                nsources,
                nparams,
            });
        }
        Ok(Self {
            matrix,
            nsources,
            nparams,
        })
    }

    #[inline]
    pub fn nsources(&self) -> usize {
        self.nsources
    }

    #[inline]
    pub fn nparams(&self) -> usize {
        self.nparams
    }

    #[inline]
    pub fn nbins(&self) -> usize {
        self.matrix.nrows()
    }

    #[inline]
    pub fn column(&self, source: usize, param: usize) -> usize {
        source * self.nparams + param
    }

    pub fn matrix(&self) -> &SparseMatrix {
        &self.matrix
    }
}

/// Log-likelihood gradient at fixed energies
#[derive(Clone, Debug, PartialEq)]
pub struct LikelihoodGradient {
    /// `nsources × nparams`, derivative with respect to each source's own parameters
    pub per_source: Array2<f64>,
    /// `nbins × nparams`, expectation change per bin when all sources move together
    pub per_bin: Array2<f64>,
    /// `nparams`, derivative with respect to a common shift of all sources
    pub track: Array1<f64>,
}

impl LikelihoodGradient {
    pub fn compute(
        basis: &SparseMatrix,
        gradient: &BasisGradient,
        x: ArrayView1<f64>,
        data: ArrayView1<f64>,
        noise: ArrayView1<f64>,
    ) -> Self {
        let (nbins, nsources, nparams) = (basis.nrows(), basis.ncols(), gradient.nparams());
        assert_eq!(x.len(), nsources, "energies must match basis columns");
        assert_eq!(data.len(), nbins, "data length must match basis rows");
        assert_eq!(noise.len(), nbins, "noise length must match basis rows");
        assert_eq!(gradient.nsources(), nsources, "gradient must cover every source");
        assert_eq!(gradient.nbins(), nbins, "gradient must cover every bin");

        let mut mu = noise.to_owned();
        basis.mul_vec_acc(mu.view_mut(), 1.0, x);
        assert!(mu.iter().all(|&mu| mu > 0.0), "expectations must be positive");
        let ratio = Zip::from(&data)
            .and(&mu)
            .map_collect(|&data, &mu| (data - mu) / mu);

        // Contraction over bins, then scaling by the source energy
        let contracted = gradient.matrix().tr_mul_vec(ratio.view());
        let per_source = Array2::from_shape_fn((nsources, nparams), |(j, k)| {
            x[j] * contracted[gradient.column(j, k)]
        });

        // Contraction over sources, kept per bin
        let mut per_bin = Array2::zeros((nbins, nparams));
        for (j, &energy) in x.iter().enumerate() {
            if energy == 0.0 {
                continue;
            }
            for k in 0..nparams {
                for (i, value) in gradient.matrix().col(gradient.column(j, k)) {
                    per_bin[(i, k)] += energy * value;
                }
            }
        }
        let track = per_bin
            .axis_iter(Axis(1))
            .map(|column| {
                Zip::from(&column)
                    .and(&ratio)
                    .fold(KahanSum::new(), |mut acc, &dmu, &r| {
                        acc += dmu * r;
                        acc
                    })
                    .sum()
            })
            .collect();

        Self {
            per_source,
            per_bin,
            track,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn log_likelihood(
        basis: &Array2<f64>,
        x: &Array1<f64>,
        data: &Array1<f64>,
        noise: &Array1<f64>,
    ) -> f64 {
        let mu = basis.dot(x) + noise;
        Zip::from(data)
            .and(&mu)
            .fold(0.0, |acc, &d, &mu| acc + d * mu.ln() - mu)
    }

    fn problem() -> (Array2<f64>, Array2<f64>, Array1<f64>, Array1<f64>, Array1<f64>) {
        let basis = array![[1.0, 0.2], [0.5, 1.0], [0.1, 2.0]];
        // two sources, two parameters each: columns (0, 0), (0, 1), (1, 0), (1, 1)
        let gradient = array![
            [0.3, -0.1, 0.0, 0.2],
            [-0.2, 0.0, 0.4, -0.3],
            [0.0, 0.5, -0.1, 0.1],
        ];
        let x = array![3.0, 1.5];
        let data = array![4.0, 2.0, 5.0];
        let noise = array![0.2, 0.3, 0.1];
        (basis, gradient, x, data, noise)
    }

    #[test]
    fn matches_finite_differences() {
        let (basis, gradient, x, data, noise) = problem();
        let result = LikelihoodGradient::compute(
            &SparseMatrix::from_dense(&basis).unwrap(),
            &BasisGradient::new(SparseMatrix::from_dense(&gradient).unwrap(), 2, 2).unwrap(),
            x.view(),
            data.view(),
            noise.view(),
        );

        let h = 1e-6;
        for j in 0..2 {
            for k in 0..2 {
                let column = gradient.column(2 * j + k);
                let mut plus = basis.clone();
                plus.column_mut(j).scaled_add(h, &column);
                let mut minus = basis.clone();
                minus.column_mut(j).scaled_add(-h, &column);
                let numeric = (log_likelihood(&plus, &x, &data, &noise)
                    - log_likelihood(&minus, &x, &data, &noise))
                    / (2.0 * h);
                assert_abs_diff_eq!(result.per_source[(j, k)], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn track_gradient_sums_sources() {
        let (basis, gradient, x, data, noise) = problem();
        let result = LikelihoodGradient::compute(
            &SparseMatrix::from_dense(&basis).unwrap(),
            &BasisGradient::new(SparseMatrix::from_dense(&gradient).unwrap(), 2, 2).unwrap(),
            x.view(),
            data.view(),
            noise.view(),
        );
        assert_abs_diff_eq!(result.track, result.per_source.sum_axis(Axis(0)), epsilon = 1e-12);
        assert_abs_diff_eq!(
            result.per_bin.column(0),
            3.0 * &gradient.column(0) + 1.5 * &gradient.column(2),
            epsilon = 1e-12
        );
    }

    #[test]
    fn shape_mismatch() {
        let err = BasisGradient::new(SparseMatrix::zeros(3, 5), 2, 3).unwrap_err();
        assert_eq!(
            err,
            MillipedeError::GradientShapeMismatch {
                actual: 5,
                nsources: 2,
                nparams: 3
            }
        );
    }
}
