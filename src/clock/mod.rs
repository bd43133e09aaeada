//! Time sources for the timer registry: [`RealClock`] backed by tokio timers
//! and [`VirtualClock`] for tests.

mod real;
mod virtual_clock;

use std::{fmt, ops::Add, sync::Arc, time::Duration};

pub use real::*;
pub use virtual_clock::*;

/// Point in time on a clock, measured from the clock's own epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }

    pub fn saturating_since(&self, now: Timestamp) -> Duration {
        self.0.saturating_sub(now.0)
    }

    pub fn checked_add(&self, rhs: Duration) -> Option<Timestamp> {
        self.0.checked_add(rhs).map(Timestamp)
    }
}

/// Saturates instead of overflowing.
impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs))
    }
}

impl From<Duration> for Timestamp {
    fn from(value: Duration) -> Self {
        Timestamp(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

/// Opaque timer id. Handles are handed out in increasing order starting at 1,
/// so ordering handles orders timers by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(pub u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait FireSink: Send + Sync {
    /// Returns `false` once the receiving side is gone.
    fn fire(&self, handle: TimerHandle, at: Timestamp) -> bool;
}

pub trait TimerSource: Send + Sync {
    fn now(&self) -> Timestamp;

    fn bind(&self, sink: Arc<dyn FireSink>);

    /// Arms (or re-arms) `handle` to fire at `at`. With an `interval` the
    /// clock re-arms the timer itself on every fire, until the next fire time
    /// is no longer representable.
    fn arm(&self, handle: TimerHandle, at: Timestamp, interval: Option<Duration>);

    /// Forgets `handle`. Unknown handles are ignored.
    fn disarm(&self, handle: TimerHandle);

    fn shutdown(&self) {}
}
