use crate::error::MillipedeError;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Detector module identifier
///
/// Ordering is lexicographic in `(string, om)`, which fixes the order of the basis matrix rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleKey {
    pub string: i32,
    pub om: u32,
}

impl ModuleKey {
    pub fn new(string: i32, om: u32) -> Self {
        Self { string, om }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.string, self.om)
    }
}

/// Binned observation of a single detector module
///
/// `valid[i]` marks whether bin `i` enters the fit, `charges[i]` is the observed photon count
/// and `noise[i]` the expected background count of the bin.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObservationCache {
    nbins: usize,
    valid: Vec<bool>,
    charges: Vec<f64>,
    noise: Vec<f64>,
}

impl ObservationCache {
    /// Validate and build a cache
    ///
    /// Lengths must equal `nbins`. Valid bins must have non-negative finite charges and positive
    /// finite noise, invalid bins are not checked.
    pub fn new(
        key: ModuleKey,
        nbins: usize,
        valid: Vec<bool>,
        charges: Vec<f64>,
        noise: Vec<f64>,
    ) -> Result<Self, MillipedeError> {
        for (what, actual) in [
            ("validity flags", valid.len()),
            ("charges", charges.len()),
            ("noise values", noise.len()),
        ] {
            if actual != nbins {
                return Err(MillipedeError::CacheLengthMismatch {
                    key,
                    what,
                    actual,
                    nbins,
                });
            }
        }
        for bin in (0..nbins).filter(|&bin| valid[bin]) {
            if !(charges[bin].is_finite() && charges[bin] >= 0.0) {
                return Err(MillipedeError::InvalidCacheValue {
                    key,
                    what: "charge",
                    bin,
                    value: charges[bin],
                });
            }
            if !(noise[bin].is_finite() && noise[bin] > 0.0) {
                return Err(MillipedeError::InvalidCacheValue {
                    key,
                    what: "noise",
                    bin,
                    value: noise[bin],
                });
            }
        }
        Ok(Self {
            nbins,
            valid,
            charges,
            noise,
        })
    }

    /// Cache with every bin valid
    pub fn all_valid(
        key: ModuleKey,
        charges: Vec<f64>,
        noise: Vec<f64>,
    ) -> Result<Self, MillipedeError> {
        let nbins = charges.len();
        Self::new(key, nbins, vec![true; nbins], charges, noise)
    }

    #[inline]
    pub fn nbins(&self) -> usize {
        self.nbins
    }

    #[inline]
    pub fn valid(&self) -> &[bool] {
        &self.valid
    }

    #[inline]
    pub fn charges(&self) -> &[f64] {
        &self.charges
    }

    #[inline]
    pub fn noise(&self) -> &[f64] {
        &self.noise
    }

    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// `(charge, noise)` of valid bins in bin order
    pub fn valid_bins(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.valid
            .iter()
            .zip(self.charges.iter().zip(self.noise.iter()))
            .filter(|(valid, _)| **valid)
            .map(|(_, (&charge, &noise))| (charge, noise))
    }
}
