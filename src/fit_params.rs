use crate::kahan::KahanSum;
use crate::sparse::SparseMatrix;

use ndarray::{ArrayView1, Zip};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Goodness-of-fit summary of an energy unfolding
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FitParams {
    /// Total observed charge `Σd`
    pub qtotal: f64,
    /// Total expected charge `Σμ`
    pub predicted_qtotal: f64,
    /// `Σ(d - μ)²`
    pub squared_residuals: f64,
    /// `Σ(d - μ)² / max(d, 1)`
    pub chi_squared: f64,
    /// Degrees of freedom of `chi_squared`
    pub chi_squared_dof: f64,
    /// Poisson deviance `2Σ[d ln(d/μ) + μ - d]`
    pub logl_ratio: f64,
    /// Number of bins minus number of sources
    pub ndof: i64,
    /// Negative Poisson log-likelihood `-Σ[d ln μ - μ - ln Γ(d + 1)]`
    pub logl: f64,
    /// `logl / ndof`, or `logl` if there are no degrees of freedom
    pub rlogl: f64,
    /// Number of minimizer iterations, zero unless filled by the caller
    pub nmini: u32,
}

/// Evaluate fit statistics for energies `x`
///
/// Expectations are `μ = Bx + b + ε`, `ε` keeps the logarithms finite for bins without noise and
/// support. Without sources the trivial default is returned.
pub fn fit_statistics(
    basis: &SparseMatrix,
    x: ArrayView1<f64>,
    data: ArrayView1<f64>,
    noise: ArrayView1<f64>,
    epsilon: f64,
) -> FitParams {
    assert_eq!(x.len(), basis.ncols(), "energies must match basis columns");
    assert_eq!(data.len(), basis.nrows(), "data length must match basis rows");
    assert_eq!(noise.len(), basis.nrows(), "noise length must match basis rows");
    if x.is_empty() {
        return FitParams::default();
    }

    let mut mu = noise.mapv(|b| b + epsilon);
    basis.mul_vec_acc(mu.view_mut(), 1.0, x);

    let mut llh = KahanSum::new();
    let mut qtotal = KahanSum::new();
    let mut predicted_qtotal = KahanSum::new();
    let mut squared_residuals = KahanSum::new();
    let mut chi_squared = KahanSum::new();
    let mut deviance = KahanSum::new();
    Zip::from(&data).and(&mu).for_each(|&d, &mu| {
        llh += d * mu.ln() - mu - libm::lgamma(d + 1.0);
        qtotal += d;
        predicted_qtotal += mu;
        let residual2 = (d - mu).powi(2);
        squared_residuals += residual2;
        chi_squared += residual2 / d.max(1.0);
        let saturated = if d > 0.0 { d * (d / mu).ln() } else { 0.0 };
        deviance += saturated + mu - d;
    });

    let ndof = basis.nrows() as i64 - basis.ncols() as i64;
    let logl = -llh.sum();
    FitParams {
        qtotal: qtotal.sum(),
        predicted_qtotal: predicted_qtotal.sum(),
        squared_residuals: squared_residuals.sum(),
        chi_squared: chi_squared.sum(),
        chi_squared_dof: ndof as f64,
        logl_ratio: 2.0 * deviance.sum(),
        ndof,
        logl,
        rlogl: if ndof > 0 { logl / ndof as f64 } else { logl },
        nmini: 0,
    }
}
