use crate::data::{ModuleKey, ObservationCache};
use crate::kahan::kahan_sum;

use ndarray::Array1;
use std::collections::BTreeMap;
use std::ops::Range;

/// Dense observed-count and expected-noise vectors aligned with the basis matrix rows
#[derive(Clone, Debug, PartialEq)]
pub struct DataVectors {
    pub data: Array1<f64>,
    pub noise: Array1<f64>,
    module_rows: BTreeMap<ModuleKey, Range<usize>>,
}

impl DataVectors {
    /// Number of rows, i.e. the total number of valid bins
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Rows occupied by the valid bins of a module
    pub fn module_rows(&self, key: &ModuleKey) -> Option<Range<usize>> {
        self.module_rows.get(key).cloned()
    }

    pub fn total_charge(&self) -> f64 {
        kahan_sum(self.data.iter().copied())
    }
}

/// Concatenate valid bins of all modules in key order
///
/// The map ordering is the module ordering of the basis matrix rows, bins of a module keep their
/// relative order.
pub fn build_data_vectors(caches: &BTreeMap<ModuleKey, ObservationCache>) -> DataVectors {
    let nrows = caches.values().map(ObservationCache::n_valid).sum();
    let mut data = Vec::with_capacity(nrows);
    let mut noise = Vec::with_capacity(nrows);
    let mut module_rows = BTreeMap::new();
    for (key, cache) in caches {
        let start = data.len();
        for (charge, bin_noise) in cache.valid_bins() {
            data.push(charge);
            noise.push(bin_noise);
        }
        module_rows.insert(*key, start..data.len());
    }
    DataVectors {
        data: data.into(),
        noise: noise.into(),
        module_rows,
    }
}
