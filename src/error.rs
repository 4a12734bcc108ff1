use crate::data::ModuleKey;

/// Error returned when the input of an unfolding is malformed
///
/// Violations of the solver's own preconditions (mismatched vector lengths handed directly to
/// [crate::PcgPoissonSolver], non-positive expectations) are caller bugs and panic instead.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MillipedeError {
    #[error("observation cache of module {key} has {actual} {what}, but nbins is {nbins}")]
    CacheLengthMismatch {
        key: ModuleKey,
        what: &'static str,
        actual: usize,
        nbins: usize,
    },

    #[error("observation cache of module {key} has invalid {what} {value} in bin {bin}")]
    InvalidCacheValue {
        key: ModuleKey,
        what: &'static str,
        bin: usize,
        value: f64,
    },

    #[error("basis matrix has {actual} {what}, {expected} expected")]
    BasisShapeMismatch {
        what: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error("basis gradient has {actual} columns, expected {nsources} sources x {nparams} parameters")]
    GradientShapeMismatch {
        actual: usize,
        nsources: usize,
        nparams: usize,
    },

    #[error("sparse matrix triplet ({row}, {col}) is outside of the {nrows}x{ncols} shape")]
    TripletOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },

    #[error("sparse matrix creation failed: {0}")]
    SparseCreation(String),
}
