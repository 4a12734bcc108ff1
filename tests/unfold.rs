use approx::assert_abs_diff_eq;
use millipede::ndarray::{Array1, array};
use millipede::{
    BasisGradient, Millipede, MillipedeConfig, PcgPoissonSolver, SolveStatus, SolverConfig, Source,
    SourceShape, SparseMatrix, build_data_vectors, penalized_negative_log_likelihood,
    penalty_matrix,
};
use millipede_test_util::{EventGeometry, SyntheticEvent, poisson_counts, single_module_caches};

fn precise() -> SolverConfig {
    SolverConfig::new(1e-14, 0, 1000, 1e-3)
}

fn track(n: usize) -> Vec<Source> {
    (0..n)
        .map(|i| {
            Source::new(
                [0.0, 0.0, -10.0 * i as f64],
                [0.0, 0.0, -1.0],
                0.0,
                SourceShape::ContinuousTrack,
            )
        })
        .collect()
}

#[test]
fn single_source_two_bins() {
    let caches = single_module_caches(vec![5.0, 7.0], vec![0.1, 0.1]);
    let millipede = Millipede::new(MillipedeConfig::new(0.0, 0.0, precise()));

    // Σ B_i (1 - d_i / μ_i) = 0 with μ_i = x + 0.1
    let basis = SparseMatrix::from_dense(&array![[1.0], [1.0]]).unwrap();
    let mut sources = track(1);
    let params = millipede.unfold(&caches, &basis, &mut sources).unwrap();
    assert_abs_diff_eq!(sources[0].energy, 5.9, epsilon = 1e-4);
    assert_eq!(params.chi_squared_dof, 1.0);
    assert_eq!(params.ndof, 1);
    assert_eq!(params.qtotal, 12.0);

    let basis = SparseMatrix::from_dense(&array![[0.5], [0.5]]).unwrap();
    let mut sources = track(1);
    let params = millipede.unfold(&caches, &basis, &mut sources).unwrap();
    assert_abs_diff_eq!(sources[0].energy, 11.8, epsilon = 1e-4);
    assert_eq!(params.chi_squared_dof, 1.0);
    // μ = 6 in both bins, shifted by the default ε
    assert_abs_diff_eq!(params.predicted_qtotal, 12.002, epsilon = 1e-3);
}

#[test]
fn zero_data_gives_zero_energies() {
    let caches = single_module_caches(vec![0.0; 4], vec![0.5; 4]);
    let basis = SparseMatrix::from_dense(&array![
        [1.0, 0.0],
        [0.5, 0.5],
        [0.0, 1.0],
        [0.2, 0.3]
    ])
    .unwrap();
    let mut sources = track(2);
    sources[0].energy = 100.0;
    let params = Millipede::default()
        .unfold(&caches, &basis, &mut sources)
        .unwrap();
    assert!(sources.iter().all(|source| source.energy == 0.0));
    assert_eq!(params.nmini, 1);
}

#[test]
fn identity_basis_recovers_data() {
    let data = array![4.0, 17.0, 0.0, 9.0, 1.0];
    let noise = Array1::from_elem(5, 1e-3);
    let basis = SparseMatrix::from_triplets(5, 5, (0..5).map(|i| (i, i, 1.0))).unwrap();
    let result = PcgPoissonSolver::new(precise()).solve(&basis, None, data.view(), noise.view());
    assert_abs_diff_eq!(result.energies, &data - &noise, epsilon = 1e-2);
}

#[test]
fn synthetic_event_properties() {
    let event = SyntheticEvent::generate(&EventGeometry::default(), 42);
    let millipede = Millipede::new(MillipedeConfig::new(1.0, 1e-2, SolverConfig::default()));

    let mut objectives = vec![];
    let mut sources = event.sources.clone();
    let params = millipede
        .unfold_with_callback(&event.caches, &event.basis, &mut sources, |state| {
            assert!(state.energies.iter().all(|&x| x >= 0.0));
            objectives.push(state.objective);
        })
        .unwrap();

    assert!(sources.iter().all(|source| source.energy >= 0.0));
    for pair in objectives.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-9 * pair[0].abs());
    }
    assert_eq!(params.nmini as usize, objectives.len());
    assert!(params.logl.is_finite());
    assert_eq!(
        params.ndof,
        event.basis.nrows() as i64 - event.basis.ncols() as i64
    );

    // The result does not depend on anything but the inputs
    let mut again = event.sources.clone();
    let params_again = millipede
        .unfold(&event.caches, &event.basis, &mut again)
        .unwrap();
    assert_eq!(sources, again);
    assert_eq!(params, params_again);
}

#[test]
fn solution_beats_truth() {
    let event = SyntheticEvent::generate(&EventGeometry::default(), 7);
    let millipede = Millipede::new(MillipedeConfig::new(0.0, 0.0, precise()));
    let mut sources = event.sources.clone();
    millipede
        .unfold(&event.caches, &event.basis, &mut sources)
        .unwrap();

    let vectors = build_data_vectors(&event.caches);
    let objective = |x: &Array1<f64>| {
        penalized_negative_log_likelihood(
            &event.basis,
            None,
            x.view(),
            vectors.data.view(),
            vectors.noise.view(),
        )
    };
    let fitted: Array1<f64> = sources.iter().map(|source| source.energy).collect();
    let truth = Array1::from(event.true_energies.clone());
    assert!(objective(&fitted) <= objective(&truth));
}

/// Variance of the differences between neighbouring segment energies
fn difference_variance(energies: &Array1<f64>) -> f64 {
    let diffs: Vec<f64> = energies
        .windows(2)
        .into_iter()
        .map(|pair| pair[1] - pair[0])
        .collect();
    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    diffs.iter().map(|diff| (diff - mean).powi(2)).sum::<f64>() / diffs.len() as f64
}

#[test]
fn regularization_smooths_track() {
    const N: usize = 10;
    let data = Array1::from(poisson_counts(&[20.0; N], 2024));
    let noise = Array1::from_elem(N, 0.1);
    let basis = SparseMatrix::from_triplets(N, N, (0..N).map(|i| (i, i, 1.0))).unwrap();
    let sources = track(N);
    let solver = PcgPoissonSolver::new(precise());

    let roughness: Vec<f64> = [0.0, 1e-3, 1e-2, 1e-1, 1.0]
        .into_iter()
        .map(|mu| {
            let penalty = penalty_matrix(&sources, mu, 0.0);
            let result = solver.solve(&basis, penalty.as_ref(), data.view(), noise.view());
            assert!(result.energies.iter().all(|&x| x >= 0.0));
            difference_variance(&result.energies)
        })
        .collect();
    assert!(roughness[0] > 0.0, "{data:?}");
    for pair in roughness.windows(2) {
        assert!(pair[1] < pair[0], "{roughness:?}");
    }
}

#[test]
fn stochastic_penalty_shrinks_cascades() {
    let caches = single_module_caches(vec![10.0, 40.0, 10.0], vec![0.1; 3]);
    let basis = SparseMatrix::from_triplets(3, 3, (0..3).map(|i| (i, i, 1.0))).unwrap();
    let mut sources = track(3);
    sources[1].shape = SourceShape::Stochastic;

    let mut free = sources.clone();
    Millipede::new(MillipedeConfig::new(0.0, 0.0, precise()))
        .unfold(&caches, &basis, &mut free)
        .unwrap();
    let mut penalized = sources.clone();
    Millipede::new(MillipedeConfig::new(0.0, 0.1, precise()))
        .unfold(&caches, &basis, &mut penalized)
        .unwrap();

    assert!(penalized[1].energy < free[1].energy);
    assert_abs_diff_eq!(penalized[0].energy, free[0].energy, epsilon = 1e-3);
}

#[test]
fn iteration_limit_returns_last_iterate() {
    let event = SyntheticEvent::generate(&EventGeometry::default(), 3);
    let vectors = build_data_vectors(&event.caches);
    let solver = PcgPoissonSolver::new(SolverConfig::new(0.0, 0, 2, 1e-3));
    let result = solver.solve(&event.basis, None, vectors.data.view(), vectors.noise.view());
    assert!(matches!(
        result.status,
        SolveStatus::MaxIterations | SolveStatus::Stalled
    ));
    assert!(result.iterations <= 2);
    assert!(result.energies.iter().all(|&x| x >= 0.0));
}

#[test]
fn stalls_once_steps_vanish() {
    let basis = SparseMatrix::from_dense(&array![[1.0], [1.0]]).unwrap();
    let data = array![5.0, 7.0];
    let noise = array![0.1, 0.1];
    // Zero tolerance is never met, the solver stops when the iterate stops moving
    let solver = PcgPoissonSolver::new(SolverConfig::new(0.0, 0, 10000, 1e-3));
    let result = solver.solve(&basis, None, data.view(), noise.view());
    assert_eq!(result.status, SolveStatus::Stalled);
    assert!(result.iterations < 10000);
    assert_abs_diff_eq!(result.energies, array![5.9], epsilon = 1e-4);
}

#[test]
fn fisher_and_gradient_shapes() {
    let event = SyntheticEvent::generate(&EventGeometry::default(), 11);
    let millipede = Millipede::default();
    let mut sources = event.sources.clone();
    millipede
        .unfold(&event.caches, &event.basis, &mut sources)
        .unwrap();

    let fisher = millipede
        .fisher(&event.caches, &event.basis, &sources)
        .unwrap();
    let n = sources.len();
    assert_eq!(fisher.dim(), (n, n));
    for i in 0..n {
        assert!(fisher[(i, i)] >= 0.0);
        for j in 0..i {
            assert_abs_diff_eq!(fisher[(i, j)], fisher[(j, i)], epsilon = 1e-9);
        }
    }

    // Derivative with respect to a common depth shift: proportional to the basis itself here
    let gradient = BasisGradient::new(event.basis.scaled(0.01), n, 1).unwrap();
    let result = millipede
        .gradient(&event.caches, &event.basis, &gradient, &sources)
        .unwrap();
    assert_eq!(result.per_source.dim(), (n, 1));
    assert_eq!(result.per_bin.dim(), (event.basis.nrows(), 1));
    assert_abs_diff_eq!(result.track[0], result.per_source.sum(), epsilon = 1e-9);
}
