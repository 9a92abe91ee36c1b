//! Inter-device clock correction
//!
//! The transport reports, per inlet, the offset to add to a remote sample
//! time stamp to express it on the local clock. Individual measurements are
//! noisy, so the estimate is the median of recent measurements. Queries are
//! rate limited because each one is a round trip to the producing node.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

/// Minimum interval between two correction queries for one source
pub const DEFAULT_CORRECTION_REFRESH: Duration = Duration::from_secs(5);

/// Measurements kept for the median
pub const DEFAULT_CORRECTION_WINDOW: usize = 16;

/// Median-filtered offset estimate for one source
#[derive(Clone, Debug)]
pub struct CorrectionEstimator {
    samples: VecDeque<f64>,
    max_samples: usize,
    offset: f64,
    jitter: f64,
}

impl CorrectionEstimator {
    pub fn new(max_samples: usize) -> Self {
        CorrectionEstimator {
            samples: VecDeque::with_capacity(max_samples.max(1)),
            max_samples: max_samples.max(1),
            offset: 0.0,
            jitter: 0.0,
        }
    }

    /// Add a measurement; returns the updated offset
    ///
    /// Non-finite measurements are ignored.
    pub fn update(&mut self, measurement: f64) -> f64 {
        if !measurement.is_finite() {
            return self.offset;
        }
        self.samples.push_back(measurement);
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        self.offset = median(self.samples.iter().copied());
        self.jitter = self
            .samples
            .iter()
            .map(|s| (s - self.offset).abs())
            .fold(0.0, f64::max);
        self.offset
    }

    /// Current offset in seconds (0.0 before the first measurement)
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Largest deviation of a kept measurement from the offset
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Default for CorrectionEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CORRECTION_WINDOW)
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Clock correction state for one inlet
///
/// A fresh tracker is due immediately so the first sample pulled already
/// carries a measured correction when one is available.
#[derive(Clone, Debug)]
pub struct ClockCorrection {
    estimator: CorrectionEstimator,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
    failures: u64,
}

impl ClockCorrection {
    pub fn new(refresh_interval: Duration) -> Self {
        ClockCorrection {
            estimator: CorrectionEstimator::default(),
            refresh_interval,
            last_refresh: None,
            failures: 0,
        }
    }

    /// Whether a new query is allowed at `now`
    pub fn refresh_due(&self, now: Instant) -> bool {
        match self.last_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh_interval,
        }
    }

    /// Record a successful query
    pub fn record(&mut self, measurement: f64, now: Instant) -> f64 {
        self.last_refresh = Some(now);
        let offset = self.estimator.update(measurement);
        debug!(measurement, offset, "clock correction refreshed");
        offset
    }

    /// Record a failed query; the previous estimate stays in effect
    pub fn record_failure(&mut self, now: Instant) {
        self.last_refresh = Some(now);
        self.failures += 1;
    }

    /// Offset to add to a remote time stamp
    pub fn current(&self) -> f64 {
        self.estimator.offset()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn estimator(&self) -> &CorrectionEstimator {
        &self.estimator
    }
}

impl Default for ClockCorrection {
    fn default() -> Self {
        Self::new(DEFAULT_CORRECTION_REFRESH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_estimator_rejects_outliers() {
        let mut est = CorrectionEstimator::new(9);
        for _ in 0..8 {
            est.update(0.050);
        }
        est.update(3.0);
        assert!((est.offset() - 0.050).abs() < 1e-9);
        assert!(est.jitter() > 2.9);
    }

    #[test]
    fn test_estimator_ignores_nan() {
        let mut est = CorrectionEstimator::default();
        est.update(0.25);
        est.update(f64::NAN);
        assert_eq!(est.sample_count(), 1);
        assert_eq!(est.offset(), 0.25);
    }

    #[test]
    fn test_refresh_rate_limited() {
        let mut corr = ClockCorrection::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(corr.refresh_due(t0));
        corr.record(0.01, t0);
        assert!(!corr.refresh_due(t0 + Duration::from_secs(4)));
        assert!(corr.refresh_due(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_failure_keeps_previous_estimate() {
        let mut corr = ClockCorrection::default();
        let t0 = Instant::now();
        corr.record(0.2, t0);
        corr.record_failure(t0 + Duration::from_secs(6));
        assert_eq!(corr.current(), 0.2);
        assert_eq!(corr.failures(), 1);
        assert!(!corr.refresh_due(t0 + Duration::from_secs(7)));
    }

    proptest! {
        #[test]
        fn prop_median_within_range(values in proptest::collection::vec(-10.0f64..10.0, 1..40)) {
            let mut est = CorrectionEstimator::new(64);
            for v in &values {
                est.update(*v);
            }
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(est.offset() >= min && est.offset() <= max);
        }
    }
}
