//! Worker tuning

use std::time::Duration;

use syncmesh_core::StreamConfig;
use syncmesh_time::{poll_interval_for_rate, PollMode, DEFAULT_CORRECTION_REFRESH};

/// Default wait for a worker to answer a request
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options shared by the workers of one stream
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerOptions {
    pub poll_mode: PollMode,
    pub poll_interval: Duration,
    /// Minimum interval between two clock-correction queries per inlet
    pub correction_refresh: Duration,
    /// Wait granted to one clock-correction query
    pub correction_timeout: Duration,
    pub response_timeout: Duration,
    /// Bound on samples pulled from one inlet in one tick
    pub max_pulls_per_tick: usize,
    /// Capacity of the command and event channels
    pub channel_capacity: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            poll_mode: PollMode::Interval,
            poll_interval: Duration::from_millis(10),
            correction_refresh: DEFAULT_CORRECTION_REFRESH,
            correction_timeout: Duration::from_millis(100),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_pulls_per_tick: 1024,
            channel_capacity: 256,
        }
    }
}

impl WorkerOptions {
    /// Options matching a stream's rate and polling precision
    pub fn for_stream(config: &StreamConfig) -> Self {
        WorkerOptions {
            poll_mode: PollMode::from_precise(config.precise_polling()),
            poll_interval: poll_interval_for_rate(config.sample_rate()),
            ..WorkerOptions::default()
        }
    }

    pub fn with_poll_mode(mut self, mode: PollMode) -> Self {
        self.poll_mode = mode;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_correction_refresh(mut self, refresh: Duration) -> Self {
        self.correction_refresh = refresh;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncmesh_core::DataType;

    #[test]
    fn test_for_stream() {
        let cfg = StreamConfig::builder("eeg")
            .channels(4)
            .sample_rate(100.0)
            .data_type(DataType::Float32)
            .precise_polling(true)
            .build()
            .unwrap();
        let opts = WorkerOptions::for_stream(&cfg);
        assert_eq!(opts.poll_mode, PollMode::BusyWait);
        assert_eq!(opts.poll_interval, Duration::from_millis(5));
        assert_eq!(opts.response_timeout, Duration::from_secs(5));
    }
}
