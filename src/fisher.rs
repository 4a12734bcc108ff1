use crate::sparse::SparseMatrix;

use ndarray::{Array2, ArrayView1, Zip};

/// Observed information of the energies, `Bᵗ diag(d / μ²) B` with `μ = Bx + b`
///
/// Only the Poisson term is included, the curvature of the regularization penalty is not added.
/// The result is dense, `nsources × nsources`.
pub fn fisher_matrix(
    basis: &SparseMatrix,
    x: ArrayView1<f64>,
    data: ArrayView1<f64>,
    noise: ArrayView1<f64>,
) -> Array2<f64> {
    assert_eq!(x.len(), basis.ncols(), "energies must match basis columns");
    assert_eq!(data.len(), basis.nrows(), "data length must match basis rows");
    assert_eq!(noise.len(), basis.nrows(), "noise length must match basis rows");

    let mut mu = noise.to_owned();
    basis.mul_vec_acc(mu.view_mut(), 1.0, x);
    assert!(mu.iter().all(|&mu| mu > 0.0), "expectations must be positive");
    let weights = Zip::from(&data)
        .and(&mu)
        .map_collect(|&data, &mu| data / (mu * mu));
    basis.weighted_gram_dense(weights.view())
}
