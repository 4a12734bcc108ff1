#![doc = include_str!("../README.md")]

mod data;
pub use data::{DataVectors, ModuleKey, ObservationCache, build_data_vectors};

mod error;
pub use error::MillipedeError;

mod fisher;
pub use fisher::fisher_matrix;

mod fit_params;
pub use fit_params::{FitParams, fit_statistics};

mod gradient;
pub use gradient::{BasisGradient, LikelihoodGradient};

mod kahan;
pub use kahan::{KahanSum, kahan_sum};

mod millipede;
pub use millipede::{Millipede, MillipedeConfig};

pub mod regularization;
pub use regularization::penalty_matrix;

pub mod solver;
pub use solver::{
    IterationState, PcgPoissonSolver, RootFinderAlgorithm, SolveResult, SolveStatus,
    SolverConfig, penalized_negative_log_likelihood,
};
#[cfg(feature = "gsl")]
pub use solver::GslRootFinder;

mod source;
pub use source::{Source, SourceShape};

mod sparse;
pub use sparse::SparseMatrix;

pub use ndarray;
