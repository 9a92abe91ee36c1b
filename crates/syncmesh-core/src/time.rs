//! Time primitives for SyncMesh
//!
//! Two clocks are in play:
//! - [`Timestamp`]: wall-clock microseconds since the UNIX epoch. Used for node
//!   bookkeeping (created/started/last seen) and event stamps, and comparable
//!   across machines up to their wall-clock skew.
//! - [`local_clock`]: monotonic seconds since process start. Used for sample
//!   time stamps; per-source clock correction reconciles it across nodes.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock time, microseconds since the UNIX epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// Current wall-clock time
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(micros(d)),
            // Clock set before 1970; treat as the epoch itself
            Err(_) => Timestamp::ZERO,
        }
    }

    #[inline]
    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    #[inline]
    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis.saturating_mul(1000))
    }

    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1_000_000.0) as i64)
    }

    #[inline]
    pub fn as_micros(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0 / 1000
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later
    #[inline]
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    /// Time elapsed since this timestamp, measured against [`Timestamp::now`]
    #[inline]
    pub fn elapsed(self) -> Duration {
        Timestamp::now().duration_since(self)
    }

    #[inline]
    pub fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(micros(duration)))
    }

    #[inline]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(micros(duration)))
    }
}

/// Whole microseconds, saturating at `i64::MAX`
fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn sub(self, rhs: Duration) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ts({:.6}s)", self.as_secs_f64())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.as_secs_f64())
    }
}

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Monotonic seconds since the first call in this process
///
/// Sample timestamps are expressed on this clock. It never jumps and never
/// goes backwards.
pub fn local_clock() -> f64 {
    let origin = CLOCK_ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!((t + Duration::from_millis(500)).as_millis(), 1_500);
        assert_eq!((t - Duration::from_millis(250)).as_millis(), 750);
        assert_eq!(
            Timestamp::from_millis(1_500).duration_since(t),
            Duration::from_millis(500)
        );
        // Earlier minus later saturates at zero
        assert_eq!(t.duration_since(Timestamp::from_millis(2_000)), Duration::ZERO);
    }

    #[test]
    fn test_timestamp_now_is_recent() {
        let now = Timestamp::now();
        assert!(now > Timestamp::from_secs_f64(1_600_000_000.0));
        assert!(now.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_local_clock_monotonic() {
        let a = local_clock();
        let b = local_clock();
        assert!(b >= a);
    }
}
