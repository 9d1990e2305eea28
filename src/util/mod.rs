//! Small shared helpers.

pub mod bijection;

pub use bijection::Bijection;

/// Kahan-compensated running sum.
///
/// Used by measurements that average long records in `f32`, where naive
/// accumulation drifts after a few million samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }
}

/// Kahan-summed mean of a slice. Returns 0 for an empty slice.
pub fn kahan_mean(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut acc = KahanSum::new();
    for &s in samples {
        acc.add(s as f64);
    }
    acc.sum() / samples.len() as f64
}
