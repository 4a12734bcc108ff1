//! Compensated summation

use std::iter::Sum;
use std::ops::AddAssign;

/// Kahan accumulator
///
/// Likelihood sums run over thousands of bins whose terms differ by many orders of magnitude,
/// the compensation term keeps the rounding error independent of the number of bins.
#[derive(Clone, Copy, Debug, Default)]
pub struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    #[inline]
    pub fn sum(self) -> f64 {
        self.sum
    }
}

impl AddAssign<f64> for KahanSum {
    #[inline]
    fn add_assign(&mut self, value: f64) {
        self.add(value);
    }
}

impl Sum<f64> for KahanSum {
    fn sum<I: Iterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Self::new();
        for value in iter {
            acc.add(value);
        }
        acc
    }
}

/// Compensated sum of an iterator of floats
pub fn kahan_sum(iter: impl IntoIterator<Item = f64>) -> f64 {
    iter.into_iter().sum::<KahanSum>().sum()
}
