//! Sparse matrix in compressed-column storage
//!
//! [SparseMatrix] wraps [faer::sparse::SparseColMat] and exposes the handful of operations the
//! unfolding needs: construction from triplets, transposition, scaled matrix-vector products
//! accumulating into dense [ndarray] vectors, scaled addition, row and column scaling, Gram
//! products and conversion to a dense matrix.

use crate::error::MillipedeError;
use crate::kahan::KahanSum;

use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use std::fmt;

#[derive(Clone)]
pub struct SparseMatrix {
    inner: SparseColMat<usize, f64>,
}

impl SparseMatrix {
    /// Build a matrix from `(row, col, value)` triplets, duplicate entries are summed
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self, MillipedeError> {
        let mut triplets: Vec<_> = triplets.into_iter().collect();
        if let Some(&(row, col, _)) = triplets
            .iter()
            .find(|&&(row, col, _)| row >= nrows || col >= ncols)
        {
            return Err(MillipedeError::TripletOutOfBounds {
                row,
                col,
                nrows,
                ncols,
            });
        }
        triplets.sort_unstable_by_key(|&(row, col, _)| (col, row));
        let mut merged: Vec<Triplet<usize, usize, f64>> = Vec::with_capacity(triplets.len());
        for (row, col, value) in triplets {
            match merged.last_mut() {
                Some(last) if last.row == row && last.col == col => last.val += value,
                _ => merged.push(Triplet::new(row, col, value)),
            }
        }
        let inner = SparseColMat::try_new_from_triplets(nrows, ncols, &merged)
            .map_err(|e| MillipedeError::SparseCreation(format!("{e:?}")))?;
        Ok(Self { inner })
    }

    /// Matrix with no stored entries
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self::from_triplets(nrows, ncols, std::iter::empty())
            .expect("empty triplet list is always valid")
    }

    pub fn from_dense(dense: &Array2<f64>) -> Result<Self, MillipedeError> {
        Self::from_triplets(
            dense.nrows(),
            dense.ncols(),
            dense
                .indexed_iter()
                .filter(|&(_, &value)| value != 0.0)
                .map(|((row, col), &value)| (row, col, value)),
        )
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        (0..self.ncols()).map(|col| self.col_rows(col).len()).sum()
    }

    #[inline]
    fn col_rows(&self, col: usize) -> &[usize] {
        self.inner.symbolic().row_idx_of_col_raw(col)
    }

    #[inline]
    fn col_values(&self, col: usize) -> &[f64] {
        self.inner.val_of_col(col)
    }

    /// Stored `(row, value)` pairs of a column in increasing row order
    pub fn col(&self, col: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.col_rows(col)
            .iter()
            .copied()
            .zip(self.col_values(col).iter().copied())
    }

    /// All stored entries as `(row, col, value)` triplets in column-major order
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.ncols()).flat_map(move |col| self.col(col).map(move |(row, v)| (row, col, v)))
    }

    /// Value at `(row, col)`, zero if the entry is not stored
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let rows = self.col_rows(col);
        match rows.binary_search(&row) {
            Ok(idx) => self.col_values(col)[idx],
            Err(_) => 0.0,
        }
    }

    pub fn transpose(&self) -> Self {
        Self::from_triplets(
            self.ncols(),
            self.nrows(),
            self.triplets().map(|(row, col, value)| (col, row, value)),
        )
        .expect("transposed triplets are within the transposed shape")
    }

    /// `y += alpha * A x`
    pub fn mul_vec_acc(&self, mut y: ArrayViewMut1<f64>, alpha: f64, x: ArrayView1<f64>) {
        assert_eq!(x.len(), self.ncols(), "x length must match number of columns");
        assert_eq!(y.len(), self.nrows(), "y length must match number of rows");
        for (col, &x_col) in x.iter().enumerate() {
            if x_col == 0.0 {
                continue;
            }
            let factor = alpha * x_col;
            for (row, value) in self.col(col) {
                y[row] += factor * value;
            }
        }
    }

    /// `A x`
    pub fn mul_vec(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let mut y = Array1::zeros(self.nrows());
        self.mul_vec_acc(y.view_mut(), 1.0, x);
        y
    }

    /// `y += alpha * Aᵗ x`, every column dot product is compensated
    pub fn tr_mul_vec_acc(&self, mut y: ArrayViewMut1<f64>, alpha: f64, x: ArrayView1<f64>) {
        assert_eq!(x.len(), self.nrows(), "x length must match number of rows");
        assert_eq!(y.len(), self.ncols(), "y length must match number of columns");
        for (col, y_col) in y.iter_mut().enumerate() {
            let dot: KahanSum = self.col(col).map(|(row, value)| value * x[row]).sum();
            *y_col += alpha * dot.sum();
        }
    }

    /// `Aᵗ x`
    pub fn tr_mul_vec(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let mut y = Array1::zeros(self.ncols());
        self.tr_mul_vec_acc(y.view_mut(), 1.0, x);
        y
    }

    /// `xᵗ A y`
    pub fn bilinear(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        assert_eq!(x.len(), self.nrows(), "x length must match number of rows");
        assert_eq!(y.len(), self.ncols(), "y length must match number of columns");
        self.triplets()
            .map(|(row, col, value)| x[row] * value * y[col])
            .sum::<KahanSum>()
            .sum()
    }

    /// `alpha * A + beta * B`
    pub fn add_scaled(alpha: f64, a: &Self, beta: f64, b: &Self) -> Self {
        assert_eq!(a.nrows(), b.nrows(), "matrices must have the same number of rows");
        assert_eq!(a.ncols(), b.ncols(), "matrices must have the same number of columns");
        let a_iter = a.triplets().map(|(row, col, v)| (row, col, alpha * v));
        let b_iter = b.triplets().map(|(row, col, v)| (row, col, beta * v));
        Self::from_triplets(a.nrows(), a.ncols(), a_iter.chain(b_iter))
            .expect("both operands share the same shape")
    }

    /// `alpha * A`
    pub fn scaled(&self, alpha: f64) -> Self {
        self.map_triplets(|_, _, value| alpha * value)
    }

    /// `diag(s) A`
    pub fn scale_rows(&self, s: ArrayView1<f64>) -> Self {
        assert_eq!(s.len(), self.nrows(), "scale length must match number of rows");
        self.map_triplets(|row, _, value| s[row] * value)
    }

    /// `A diag(s)`
    pub fn scale_cols(&self, s: ArrayView1<f64>) -> Self {
        assert_eq!(s.len(), self.ncols(), "scale length must match number of columns");
        self.map_triplets(|_, col, value| s[col] * value)
    }

    fn map_triplets(&self, f: impl Fn(usize, usize, f64) -> f64) -> Self {
        Self::from_triplets(
            self.nrows(),
            self.ncols(),
            self.triplets()
                .map(|(row, col, value)| (row, col, f(row, col, value))),
        )
        .expect("mapping values keeps the shape")
    }

    /// Column sums `1ᵗ A`
    pub fn col_sums(&self) -> Array1<f64> {
        (0..self.ncols())
            .map(|col| self.col(col).map(|(_, v)| v).sum::<KahanSum>().sum())
            .collect()
    }

    /// `Aᵗ A` as a sparse matrix
    pub fn gram(&self) -> Self {
        let rows = self.transpose();
        let triplets = (0..rows.ncols()).flat_map(|row| {
            let entries: Vec<_> = rows.col(row).collect();
            let mut products = Vec::with_capacity(entries.len() * entries.len());
            for &(i, a) in &entries {
                for &(j, b) in &entries {
                    products.push((i, j, a * b));
                }
            }
            products
        });
        Self::from_triplets(self.ncols(), self.ncols(), triplets)
            .expect("Gram matrix triplets are within the square shape")
    }

    /// Dense `Aᵗ diag(w) A`
    pub fn weighted_gram_dense(&self, w: ArrayView1<f64>) -> Array2<f64> {
        assert_eq!(w.len(), self.nrows(), "weight length must match number of rows");
        let n = self.ncols();
        let mut result = Array2::zeros((n, n));
        let mut scattered = Array1::<f64>::zeros(self.nrows());
        for k in 0..n {
            for (row, value) in self.col(k) {
                scattered[row] = w[row] * value;
            }
            for j in 0..=k {
                let dot: KahanSum = self.col(j).map(|(row, v)| v * scattered[row]).sum();
                result[(j, k)] = dot.sum();
                result[(k, j)] = result[(j, k)];
            }
            for (row, _) in self.col(k) {
                scattered[row] = 0.0;
            }
        }
        result
    }

    /// Dense copy, intended for small matrices
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.nrows(), self.ncols()));
        for (row, col, value) in self.triplets() {
            dense[(row, col)] += value;
        }
        dense
    }
}

impl fmt::Debug for SparseMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseMatrix")
            .field("nrows", &self.nrows())
            .field("ncols", &self.ncols())
            .field("nnz", &self.nnz())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::{Axis, array};
    use rand::prelude::*;

    fn example() -> SparseMatrix {
        // [[1, 0, 2],
        //  [0, 3, 0],
        //  [4, 0, 5],
        //  [0, 0, 6]]
        SparseMatrix::from_triplets(
            4,
            3,
            [
                (2, 2, 5.0),
                (0, 0, 1.0),
                (1, 1, 3.0),
                (0, 2, 2.0),
                (2, 0, 4.0),
                (3, 2, 6.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn duplicates_are_summed() {
        let m = SparseMatrix::from_triplets(2, 2, [(0, 1, 1.0), (0, 1, 2.5), (1, 0, 1.0)]).unwrap();
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.get(0, 1), 3.5);
        assert_eq!(m.get(1, 1), 0.0);
    }

    #[test]
    fn out_of_bounds_triplet() {
        let err = SparseMatrix::from_triplets(2, 2, [(2, 0, 1.0)]).unwrap_err();
        assert_eq!(
            err,
            MillipedeError::TripletOutOfBounds {
                row: 2,
                col: 0,
                nrows: 2,
                ncols: 2
            }
        );
    }

    #[test]
    fn dense_round_trip() {
        let m = example();
        let dense = m.to_dense();
        assert_eq!(
            dense,
            array![[1.0, 0.0, 2.0], [0.0, 3.0, 0.0], [4.0, 0.0, 5.0], [0.0, 0.0, 6.0]]
        );
        assert_eq!(m.transpose().to_dense(), dense.t());
    }

    #[test]
    fn products() {
        let m = example();
        let dense = m.to_dense();
        let x = array![1.0, -2.0, 0.5];
        let y = array![0.5, 1.0, -1.0, 2.0];
        assert_abs_diff_eq!(m.mul_vec(x.view()), dense.dot(&x), epsilon = 1e-12);
        assert_abs_diff_eq!(m.tr_mul_vec(y.view()), dense.t().dot(&y), epsilon = 1e-12);
        assert_abs_diff_eq!(
            m.bilinear(y.view(), x.view()),
            y.dot(&dense.dot(&x)),
            epsilon = 1e-12
        );

        let mut acc = array![1.0, 1.0, 1.0, 1.0];
        m.mul_vec_acc(acc.view_mut(), -2.0, x.view());
        assert_abs_diff_eq!(acc, 1.0 - 2.0 * dense.dot(&x), epsilon = 1e-12);
    }

    #[test]
    fn scaling_and_addition() {
        let m = example();
        let dense = m.to_dense();
        let s_rows = array![1.0, 2.0, 3.0, 4.0];
        let s_cols = array![-1.0, 0.5, 2.0];
        assert_abs_diff_eq!(
            m.scale_rows(s_rows.view()).to_dense(),
            Array2::from_diag(&s_rows).dot(&dense),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            m.scale_cols(s_cols.view()).to_dense(),
            dense.dot(&Array2::from_diag(&s_cols)),
            epsilon = 1e-12
        );
        let sum = SparseMatrix::add_scaled(2.0, &m, -0.5, &m.scale_rows(s_rows.view()));
        assert_abs_diff_eq!(
            sum.to_dense(),
            2.0 * &dense - 0.5 * Array2::from_diag(&s_rows).dot(&dense),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(m.col_sums(), array![5.0, 3.0, 13.0], epsilon = 1e-12);
    }

    #[test]
    fn gram_matrices() {
        let m = example();
        let dense = m.to_dense();
        assert_abs_diff_eq!(m.gram().to_dense(), dense.t().dot(&dense), epsilon = 1e-12);
        let w = array![0.5, 1.0, 2.0, 0.25];
        assert_abs_diff_eq!(
            m.weighted_gram_dense(w.view()),
            dense.t().dot(&Array2::from_diag(&w)).dot(&dense),
            epsilon = 1e-12
        );
    }

    #[test]
    fn empty_matrix() {
        let m = SparseMatrix::zeros(3, 0);
        assert_eq!(m.nnz(), 0);
        assert_eq!(m.col_sums().len(), 0);
        assert_eq!(m.mul_vec(Array1::zeros(0).view()), Array1::<f64>::zeros(3));
        assert_eq!(m.gram().nrows(), 0);
    }

    #[test]
    fn random_matrix_matches_dense() {
        let mut rng = StdRng::seed_from_u64(0);
        let (nrows, ncols) = (40, 15);
        let triplets: Vec<_> = (0..120)
            .map(|_| {
                (
                    rng.random_range(0..nrows),
                    rng.random_range(0..ncols),
                    rng.random::<f64>() - 0.5,
                )
            })
            .collect();
        let m = SparseMatrix::from_triplets(nrows, ncols, triplets.iter().copied()).unwrap();

        let mut dense = Array2::zeros((nrows, ncols));
        for &(row, col, value) in triplets.iter() {
            dense[(row, col)] += value;
        }
        assert_abs_diff_eq!(m.to_dense(), dense, epsilon = 1e-12);

        let x: Array1<f64> = (0..ncols).map(|_| rng.random()).collect();
        let w: Array1<f64> = (0..nrows).map(|_| rng.random()).collect();
        assert_abs_diff_eq!(m.mul_vec(x.view()), dense.dot(&x), epsilon = 1e-12);
        assert_abs_diff_eq!(m.transpose().to_dense(), dense.t(), epsilon = 1e-12);
        assert_abs_diff_eq!(m.gram().to_dense(), dense.t().dot(&dense), epsilon = 1e-12);
        let weighted = dense.t().dot(&(&dense * &w.clone().insert_axis(Axis(1))));
        assert_abs_diff_eq!(m.weighted_gram_dense(w.view()), weighted, epsilon = 1e-12);
    }
}
