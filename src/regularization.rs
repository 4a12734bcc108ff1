//! Quadratic penalty operators for the energy unfolding
//!
//! The penalty added to the negative log-likelihood is `xᵗ Q x` with
//! `Q = μ_c Pcᵗ Pc + μ_s Psᵗ Ps`, where `Pc` takes first differences between neighbouring track
//! segments and `Ps` selects stochastic segments.

use crate::source::Source;
use crate::sparse::SparseMatrix;

use itertools::Itertools;

fn nominal_rows(nsources: usize) -> usize {
    nsources.saturating_sub(1)
}

/// Operator selecting every non-track source
///
/// Row `r` has a single unit entry in the column of the `r`-th stochastic source. The operator
/// has `nsources - 1` rows unless every source is stochastic.
pub fn stochastic_penalty(sources: &[Source]) -> SparseMatrix {
    let columns: Vec<_> = sources
        .iter()
        .positions(|source| !source.is_track())
        .collect();
    let nrows = nominal_rows(sources.len()).max(columns.len());
    SparseMatrix::from_triplets(
        nrows,
        sources.len(),
        columns
            .into_iter()
            .enumerate()
            .map(|(row, col)| (row, col, 1.0)),
    )
    .expect("one row per stochastic source fits into the operator")
}

/// First-difference operator between consecutive track sources
///
/// Stochastic sources in between are skipped, so the difference couples the closest track
/// segments on both sides of a cascade.
pub fn continuous_penalty(sources: &[Source]) -> SparseMatrix {
    let triplets = sources
        .iter()
        .positions(Source::is_track)
        .tuple_windows()
        .enumerate()
        .flat_map(|(row, (i, j))| [(row, i, 1.0), (row, j, -1.0)]);
    SparseMatrix::from_triplets(nominal_rows(sources.len()), sources.len(), triplets)
        .expect("there are fewer track pairs than sources")
}

/// Combined penalty matrix `Q`
///
/// Terms with non-positive weight are omitted, `None` means there is no penalty at all.
pub fn penalty_matrix(
    sources: &[Source],
    mu_continuous: f64,
    mu_stochastic: f64,
) -> Option<SparseMatrix> {
    let terms: [(f64, fn(&[Source]) -> SparseMatrix); 2] = [
        (mu_continuous, continuous_penalty),
        (mu_stochastic, stochastic_penalty),
    ];
    terms
        .into_iter()
        .filter(|&(weight, _)| weight > 0.0)
        .map(|(weight, operator)| operator(sources).gram().scaled(weight))
        .reduce(|a, b| SparseMatrix::add_scaled(1.0, &a, 1.0, &b))
        .filter(|q| q.nnz() > 0)
}
