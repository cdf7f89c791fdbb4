//! Time source shared by the safety layer and the work authority.
//!
//! Lockouts, the motor rate window and work-order TTLs all expire lazily,
//! checked against [`Clock::now`] on the next access. Injecting the clock
//! lets tests move time forward with [`ManualClock::advance`] instead of
//! sleeping.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Monotonic plus wall-clock time source.
pub trait Clock: Send + Sync {
    /// Monotonic reading used for windows and lockouts.
    fn now(&self) -> Instant;
    /// Wall-clock reading used for timestamps that end up in audit records.
    fn utc(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// ```
/// use std::time::Duration;
/// use safefs_kernel::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let t0 = clock.now();
/// clock.advance(Duration::from_secs(30));
/// assert_eq!(clock.now() - t0, Duration::from_secs(30));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_utc: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Start at the current real time.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_utc: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move both readings forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn utc(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        let micros = i64::try_from(offset.as_micros()).unwrap_or(i64::MAX);
        self.base_utc
            .checked_add_signed(chrono::Duration::microseconds(micros))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_frozen_until_advanced() {
        let clock = ManualClock::new();
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, b);
    }

    #[test]
    fn advance_moves_both_readings() {
        let clock = ManualClock::new();
        let (i0, u0) = (clock.now(), clock.utc());
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - i0, Duration::from_millis(1500));
        assert_eq!((clock.utc() - u0).num_milliseconds(), 1500);
    }

    #[test]
    fn utc_saturates_past_representable_range() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(u64::MAX / 4));
        assert_eq!(clock.utc(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        assert!(clock.now() >= a);
    }
}
