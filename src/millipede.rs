use crate::data::{DataVectors, ModuleKey, ObservationCache, build_data_vectors};
use crate::error::MillipedeError;
use crate::fisher::fisher_matrix;
use crate::fit_params::{FitParams, fit_statistics};
use crate::gradient::{BasisGradient, LikelihoodGradient};
use crate::regularization::penalty_matrix;
use crate::solver::{IterationState, PcgPoissonSolver, SolverConfig};
use crate::source::Source;
use crate::sparse::SparseMatrix;

use ndarray::{Array1, Array2};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Settings of [Millipede]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MillipedeConfig {
    /// Weight of the smoothness penalty between neighbouring track segments
    pub muon_regularization: f64,
    /// Weight of the penalty on the energy of stochastic segments
    pub stochastic_regularization: f64,
    pub solver: SolverConfig,
}

impl MillipedeConfig {
    /// Create a new [MillipedeConfig]
    ///
    /// Non-positive regularization weights switch the corresponding penalty off.
    pub fn new(
        muon_regularization: f64,
        stochastic_regularization: f64,
        solver: SolverConfig,
    ) -> Self {
        assert!(
            muon_regularization.is_finite(),
            "muon_regularization must be finite"
        );
        assert!(
            stochastic_regularization.is_finite(),
            "stochastic_regularization must be finite"
        );
        Self {
            muon_regularization,
            stochastic_regularization,
            solver,
        }
    }

    #[inline]
    pub fn default_muon_regularization() -> f64 {
        0.0
    }

    #[inline]
    pub fn default_stochastic_regularization() -> f64 {
        0.0
    }
}

impl Default for MillipedeConfig {
    fn default() -> Self {
        Self::new(
            Self::default_muon_regularization(),
            Self::default_stochastic_regularization(),
            SolverConfig::default(),
        )
    }
}

/// Energy-loss unfolding of a single event
///
/// Combines the observation caches, the basis matrix and the source list: builds the data
/// vectors and the penalty, runs [PcgPoissonSolver], writes the energies back into the sources
/// and summarizes the fit quality.
#[derive(Clone, Debug, Default)]
pub struct Millipede {
    config: MillipedeConfig,
}

impl Millipede {
    pub fn new(config: MillipedeConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &MillipedeConfig {
        &self.config
    }

    fn data_vectors(
        caches: &BTreeMap<ModuleKey, ObservationCache>,
        basis: &SparseMatrix,
        nsources: usize,
    ) -> Result<DataVectors, MillipedeError> {
        let vectors = build_data_vectors(caches);
        if basis.nrows() != vectors.len() {
            return Err(MillipedeError::BasisShapeMismatch {
                what: "rows",
                actual: basis.nrows(),
                expected: vectors.len(),
            });
        }
        if basis.ncols() != nsources {
            return Err(MillipedeError::BasisShapeMismatch {
                what: "columns",
                actual: basis.ncols(),
                expected: nsources,
            });
        }
        Ok(vectors)
    }

    fn energies(sources: &[Source]) -> Array1<f64> {
        sources.iter().map(|source| source.energy).collect()
    }

    /// Solve for the source energies and store them in `sources`
    ///
    /// Without sources nothing is solved and the trivial [FitParams] are returned.
    pub fn unfold(
        &self,
        caches: &BTreeMap<ModuleKey, ObservationCache>,
        basis: &SparseMatrix,
        sources: &mut [Source],
    ) -> Result<FitParams, MillipedeError> {
        self.unfold_with_callback(caches, basis, sources, |_| {})
    }

    /// Same as [Millipede::unfold], `callback` observes every solver iteration
    pub fn unfold_with_callback<C>(
        &self,
        caches: &BTreeMap<ModuleKey, ObservationCache>,
        basis: &SparseMatrix,
        sources: &mut [Source],
        callback: C,
    ) -> Result<FitParams, MillipedeError>
    where
        C: FnMut(&IterationState),
    {
        let vectors = Self::data_vectors(caches, basis, sources.len())?;
        if sources.is_empty() {
            return Ok(FitParams::default());
        }

        let penalty = penalty_matrix(
            sources,
            self.config.muon_regularization,
            self.config.stochastic_regularization,
        );
        let solver = PcgPoissonSolver::new(self.config.solver.clone());
        let result = solver.solve_with_callback(
            basis,
            penalty.as_ref(),
            vectors.data.view(),
            vectors.noise.view(),
            callback,
        );
        for (source, &energy) in sources.iter_mut().zip(result.energies.iter()) {
            source.energy = energy;
        }

        let mut params = fit_statistics(
            basis,
            result.energies.view(),
            vectors.data.view(),
            vectors.noise.view(),
            self.config.solver.energy_epsilon,
        );
        params.nmini = result.iterations;
        debug!(
            nsources = sources.len(),
            nbins = vectors.len(),
            status = ?result.status,
            logl = params.logl,
            "unfolded energy losses"
        );
        Ok(params)
    }

    /// Fit statistics of the energies currently stored in `sources`
    pub fn fit_statistics(
        &self,
        caches: &BTreeMap<ModuleKey, ObservationCache>,
        basis: &SparseMatrix,
        sources: &[Source],
    ) -> Result<FitParams, MillipedeError> {
        let vectors = Self::data_vectors(caches, basis, sources.len())?;
        Ok(fit_statistics(
            basis,
            Self::energies(sources).view(),
            vectors.data.view(),
            vectors.noise.view(),
            self.config.solver.energy_epsilon,
        ))
    }

    /// Observed information of the energies currently stored in `sources`
    pub fn fisher(
        &self,
        caches: &BTreeMap<ModuleKey, ObservationCache>,
        basis: &SparseMatrix,
        sources: &[Source],
    ) -> Result<Array2<f64>, MillipedeError> {
        let vectors = Self::data_vectors(caches, basis, sources.len())?;
        Ok(fisher_matrix(
            basis,
            Self::energies(sources).view(),
            vectors.data.view(),
            vectors.noise.view(),
        ))
    }

    /// Log-likelihood gradient with respect to the source geometry at the stored energies
    pub fn gradient(
        &self,
        caches: &BTreeMap<ModuleKey, ObservationCache>,
        basis: &SparseMatrix,
        gradient: &BasisGradient,
        sources: &[Source],
    ) -> Result<LikelihoodGradient, MillipedeError> {
        let vectors = Self::data_vectors(caches, basis, sources.len())?;
        if gradient.nsources() != sources.len() {
            return Err(MillipedeError::GradientShapeMismatch {
                actual: gradient.matrix().ncols(),
                nsources: sources.len(),
                nparams: gradient.nparams(),
            });
        }
        if gradient.nbins() != vectors.len() {
            return Err(MillipedeError::BasisShapeMismatch {
                what: "gradient rows",
                actual: gradient.nbins(),
                expected: vectors.len(),
            });
        }
        Ok(LikelihoodGradient::compute(
            basis,
            gradient,
            Self::energies(sources).view(),
            vectors.data.view(),
            vectors.noise.view(),
        ))
    }
}
