//! Poll timers for stream workers
//!
//! Workers run on dedicated OS threads and block on their timer between
//! ticks. Two modes are available:
//! - [`PollMode::Interval`]: plain `thread::sleep` to the next deadline,
//!   limited by OS timer granularity
//! - [`PollMode::BusyWait`]: sleep until shortly before the deadline, then
//!   spin on the monotonic clock until it is reached
//!
//! Deadlines advance on a fixed grid. When a tick runs late the missed
//! deadlines are skipped rather than replayed in a burst.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

/// Shortest tick interval a timer accepts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Longest interval derived from a sample rate
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Portion of the wait spent spinning in busy-wait mode
pub const DEFAULT_SPIN_WINDOW: Duration = Duration::from_micros(500);

/// How a worker waits between ticks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollMode {
    /// Sleep for the remaining interval
    Interval,
    /// Sleep-then-spin for minimal jitter
    BusyWait,
}

impl PollMode {
    /// Busy-wait when precise polling is requested
    pub fn from_precise(precise: bool) -> Self {
        if precise {
            PollMode::BusyWait
        } else {
            PollMode::Interval
        }
    }
}

/// Poll interval for a stream sampling at `sample_rate` Hz
///
/// Polls twice per sample period so a sample never waits a full period,
/// clamped to `[MIN_POLL_INTERVAL, MAX_POLL_INTERVAL]`.
pub fn poll_interval_for_rate(sample_rate: f64) -> Duration {
    if !sample_rate.is_finite() || sample_rate <= 0.0 {
        return MAX_POLL_INTERVAL;
    }
    let half_period = Duration::from_secs_f64(0.5 / sample_rate);
    half_period.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// Block the current thread until `deadline`
///
/// Sleeps while more than `spin_window` remains, then spins.
pub fn sleep_until_precise(deadline: Instant, spin_window: Duration) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > spin_window {
            thread::sleep(remaining - spin_window);
        } else {
            hint::spin_loop();
        }
    }
}

/// Fixed-rate tick source for a worker loop
#[derive(Debug)]
pub struct PollTimer {
    mode: PollMode,
    interval: Duration,
    spin_window: Duration,
    next_deadline: Instant,
    ticks: u64,
    skipped: u64,
}

impl PollTimer {
    /// Create a new timer whose first tick is one interval from now
    pub fn new(mode: PollMode, interval: Duration) -> Self {
        let interval = interval.max(MIN_POLL_INTERVAL);
        PollTimer {
            mode,
            interval,
            spin_window: DEFAULT_SPIN_WINDOW.min(interval),
            next_deadline: Instant::now() + interval,
            ticks: 0,
            skipped: 0,
        }
    }

    pub fn with_spin_window(mut self, spin_window: Duration) -> Self {
        self.spin_window = spin_window.min(self.interval);
        self
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ticks completed so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Deadlines skipped because a tick overran
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Restart the grid from now, e.g. after a pause
    pub fn reset(&mut self) {
        self.next_deadline = Instant::now() + self.interval;
    }

    /// Block until the next deadline; returns how late the wake-up was
    pub fn wait(&mut self) -> Duration {
        let deadline = self.next_deadline;
        match self.mode {
            PollMode::Interval => {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
            }
            PollMode::BusyWait => sleep_until_precise(deadline, self.spin_window),
        }

        let now = Instant::now();
        let lateness = now.saturating_duration_since(deadline);
        self.ticks += 1;
        self.next_deadline = deadline + self.interval;
        if self.next_deadline <= now {
            let behind = now - self.next_deadline;
            let missed = (behind.as_nanos() / self.interval.as_nanos()) as u64 + 1;
            self.skipped += missed;
            self.next_deadline += self.interval * missed as u32;
            trace!(missed, ?lateness, "poll timer skipped deadlines");
        }
        lateness
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_for_rate() {
        assert_eq!(poll_interval_for_rate(100.0), Duration::from_millis(5));
        assert_eq!(poll_interval_for_rate(1.0), MAX_POLL_INTERVAL);
        assert_eq!(poll_interval_for_rate(1_000_000.0), MIN_POLL_INTERVAL);
        assert_eq!(poll_interval_for_rate(f64::NAN), MAX_POLL_INTERVAL);
    }

    #[test]
    fn test_mode_from_precise() {
        assert_eq!(PollMode::from_precise(true), PollMode::BusyWait);
        assert_eq!(PollMode::from_precise(false), PollMode::Interval);
    }

    #[test]
    fn test_busy_wait_hits_deadline() {
        let deadline = Instant::now() + Duration::from_millis(3);
        sleep_until_precise(deadline, Duration::from_micros(500));
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_timer_keeps_rate() {
        for mode in [PollMode::Interval, PollMode::BusyWait] {
            let mut timer = PollTimer::new(mode, Duration::from_millis(2));
            let start = Instant::now();
            for _ in 0..10 {
                timer.wait();
            }
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(20), "{mode:?} too fast: {elapsed:?}");
            assert_eq!(timer.ticks(), 10);
        }
    }

    #[test]
    fn test_overrun_skips_missed_deadlines() {
        let mut timer = PollTimer::new(PollMode::Interval, Duration::from_millis(1));
        thread::sleep(Duration::from_millis(10));
        timer.wait();
        assert!(timer.skipped() >= 5);
        // The next deadline lies in the future again
        let before = Instant::now();
        timer.wait();
        assert!(before.elapsed() <= Duration::from_millis(50));
    }

    #[test]
    fn test_interval_floor() {
        let timer = PollTimer::new(PollMode::BusyWait, Duration::ZERO);
        assert_eq!(timer.interval(), MIN_POLL_INTERVAL);
    }
}
