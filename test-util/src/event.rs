use millipede::{ModuleKey, ObservationCache, Source, SourceShape, SparseMatrix};
use rand::prelude::*;
use rand_distr::{Exp, Poisson};
use std::collections::BTreeMap;

/// Vertical track passing a single string of optical modules
///
/// Segment `j` sits at depth `-j * segment_length`, module `m` at depth
/// `-m * module_spacing` and horizontal distance `string_distance` from the track. The light
/// yield of a segment in a module falls off exponentially with distance and is spread over the
/// module's time bins around the direct arrival time.
#[derive(Clone, Debug)]
pub struct EventGeometry {
    pub nsegments: usize,
    pub nmodules: usize,
    pub bins_per_module: usize,
    pub segment_length: f64,
    pub module_spacing: f64,
    pub string_distance: f64,
    pub absorption_length: f64,
    pub noise_per_bin: f64,
    /// Every `stochastic_every`-th segment is a cascade, zero for a pure track
    pub stochastic_every: usize,
}

impl Default for EventGeometry {
    fn default() -> Self {
        Self {
            nsegments: 20,
            nmodules: 30,
            bins_per_module: 8,
            segment_length: 10.0,
            module_spacing: 7.0,
            string_distance: 20.0,
            absorption_length: 50.0,
            noise_per_bin: 0.01,
            stochastic_every: 5,
        }
    }
}

/// A simulated event: observed charges drawn from the Poisson model of the true energies
pub struct SyntheticEvent {
    pub caches: BTreeMap<ModuleKey, ObservationCache>,
    pub basis: SparseMatrix,
    pub sources: Vec<Source>,
    pub true_energies: Vec<f64>,
}

/// Yields below this are not stored in the basis
const MIN_YIELD: f64 = 1e-6;
const SPEED_OF_LIGHT: f64 = 0.3;
const BIN_WIDTH: f64 = 25.0;

impl SyntheticEvent {
    pub fn generate(geometry: &EventGeometry, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let cascade_energy = Exp::new(0.05).unwrap();

        let sources: Vec<_> = (0..geometry.nsegments)
            .map(|j| {
                let depth = -(j as f64) * geometry.segment_length;
                let shape = if geometry.stochastic_every > 0 && j % geometry.stochastic_every == 0
                {
                    SourceShape::Stochastic
                } else {
                    SourceShape::ContinuousTrack
                };
                let time = -depth / SPEED_OF_LIGHT;
                Source::new([0.0, 0.0, depth], [0.0, 0.0, -1.0], time, shape)
            })
            .collect();
        let true_energies: Vec<f64> = sources
            .iter()
            .map(|source| match source.shape {
                SourceShape::ContinuousTrack => 1.0 + rng.random::<f64>(),
                SourceShape::Stochastic => cascade_energy.sample(&mut rng),
            })
            .collect();

        let nbins = geometry.nmodules * geometry.bins_per_module;
        let mut triplets = vec![];
        for (j, source) in sources.iter().enumerate() {
            for m in 0..geometry.nmodules {
                let dz = source.position[2] + m as f64 * geometry.module_spacing;
                let distance = dz.hypot(geometry.string_distance);
                let total = 100.0 * (-distance / geometry.absorption_length).exp()
                    / (distance * distance)
                    * geometry.string_distance;
                // bins are counted from the direct light of the closest track point
                let closest = m as f64 * geometry.module_spacing + geometry.string_distance;
                let window_start = closest / SPEED_OF_LIGHT;
                let arrival = source.time + distance / SPEED_OF_LIGHT;
                let first_bin = ((arrival - window_start) / BIN_WIDTH).max(0.0) as usize;
                for b in first_bin..geometry.bins_per_module {
                    let delay = (b - first_bin) as i32;
                    let value = total * 0.5_f64.powi(delay + 1);
                    if value > MIN_YIELD {
                        triplets.push((m * geometry.bins_per_module + b, j, value));
                    }
                }
            }
        }
        let basis = SparseMatrix::from_triplets(nbins, geometry.nsegments, triplets).unwrap();

        let mut mu = vec![geometry.noise_per_bin; nbins];
        for (j, &energy) in true_energies.iter().enumerate() {
            for (i, value) in basis.col(j) {
                mu[i] += energy * value;
            }
        }
        let caches = (0..geometry.nmodules)
            .map(|m| {
                let key = ModuleKey::new(1, m as u32 + 1);
                let range = m * geometry.bins_per_module..(m + 1) * geometry.bins_per_module;
                let charges = mu[range]
                    .iter()
                    .map(|&mu| rng.sample(Poisson::new(mu).unwrap()))
                    .collect();
                let noise = vec![geometry.noise_per_bin; geometry.bins_per_module];
                (key, ObservationCache::all_valid(key, charges, noise).unwrap())
            })
            .collect();

        Self {
            caches,
            basis,
            sources,
            true_energies,
        }
    }
}

/// All bins valid and assigned to a single module
pub fn single_module_caches(
    charges: Vec<f64>,
    noise: Vec<f64>,
) -> BTreeMap<ModuleKey, ObservationCache> {
    let key = ModuleKey::new(1, 1);
    BTreeMap::from([(key, ObservationCache::all_valid(key, charges, noise).unwrap())])
}

/// Poisson counts drawn around `means`, reproducible for a given `seed`
pub fn poisson_counts(means: &[f64], seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    means
        .iter()
        .map(|&mean| rng.sample(Poisson::new(mean).unwrap()))
        .collect()
}
