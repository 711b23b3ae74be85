//! Injectable wall and monotonic time sources.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::ops::{Add, Sub};
use std::time::{Duration, Instant};

/// A point on the monotonic clock, measured from an arbitrary origin.
///
/// Ticks are only comparable when taken from the same [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticks(Duration);

impl Ticks {
    /// Ticks at the given offset from the clock origin.
    pub const fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    /// Offset from the clock origin.
    pub const fn as_duration(&self) -> Duration {
        self.0
    }

    /// Time remaining until `later`, zero if `later` is not in the future.
    pub fn until(&self, later: Ticks) -> Duration {
        later.0.saturating_sub(self.0)
    }
}

impl Add<Duration> for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Duration) -> Ticks {
        Ticks(self.0.saturating_add(rhs))
    }
}

impl Sub<Duration> for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: Duration) -> Ticks {
        Ticks(self.0.saturating_sub(rhs))
    }
}

/// Source of wall-clock and monotonic time.
///
/// The wall clock drives report age and endpoint expiry; the monotonic
/// clock drives backoff scheduling.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic time.
    fn ticks(&self) -> Ticks;
}

/// Clock backed by the operating system.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn ticks(&self) -> Ticks {
        Ticks(self.origin.elapsed())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, Ticks)>,
}

impl ManualClock {
    /// Creates a clock reading `wall` and zero ticks.
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new((wall, Ticks::default())),
        }
    }

    /// Moves both clocks forward by `by`. The wall clock saturates at its
    /// maximum.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        state.0 = state
            .0
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.1 = state.1 + by;
    }

    /// Sets the wall clock without touching the monotonic clock.
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        self.state.lock().0 = wall;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().0
    }

    fn ticks(&self) -> Ticks {
        self.state.lock().1
    }
}
