use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{FireSink, TimerHandle, TimerSource, Timestamp};
use crate::error::{EngineError, UnmatchedReason};

struct ArmedTimer {
    at: Timestamp,
    interval: Option<Duration>,
}

#[derive(Default)]
struct VirtualClockState {
    now: Timestamp,
    armed: BTreeMap<TimerHandle, ArmedTimer>,
    sink: Option<Arc<dyn FireSink>>,
}

impl VirtualClockState {
    fn earliest_due(&self) -> Option<(Timestamp, TimerHandle)> {
        self.armed
            .iter()
            .filter(|(_, timer)| timer.at <= self.now)
            .map(|(handle, timer)| (timer.at, *handle))
            .min()
    }
}

/// Deterministic time source for tests.
///
/// Time only moves on [`advance`](VirtualClock::advance) and nothing fires on
/// its own: every fire is an explicit [`request_fire`](VirtualClock::request_fire)
/// that has to match an armed timer whose time has been reached.
#[derive(Clone, Default)]
pub struct VirtualClock {
    state: Arc<Mutex<VirtualClockState>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, VirtualClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        let mut state = self.state();
        state.now = state.now + by;
        log::debug!("Virtual clock advanced by {:?} to {}", by, state.now);
        state.now
    }

    /// Fires `handle` at `at`. Fails with [`EngineError::UnmatchedFireRequest`]
    /// if the clock has not reached `at` yet, or if no timer with that handle is
    /// armed for `at` or earlier. A periodic timer is re-armed one interval
    /// after its scheduled time before this returns.
    pub fn request_fire(&self, handle: TimerHandle, at: Timestamp) -> Result<(), EngineError> {
        let mut state = self.state();
        let unmatched = |reason| EngineError::UnmatchedFireRequest { handle, at, reason };
        if at > state.now {
            return Err(unmatched(UnmatchedReason::ClockNotReached { now: state.now }));
        }
        let Some(timer) = state.armed.get(&handle) else {
            return Err(unmatched(UnmatchedReason::UnknownTimer));
        };
        if timer.at > at {
            return Err(unmatched(UnmatchedReason::NotDue { scheduled: timer.at }));
        }
        let Some(sink) = state.sink.clone() else {
            return Err(EngineError::Stopped);
        };
        let next = timer.interval.and_then(|i| timer.at.checked_add(i));
        match next {
            Some(next) => {
                if let Some(timer) = state.armed.get_mut(&handle) {
                    timer.at = next;
                }
            }
            None => {
                state.armed.remove(&handle);
            }
        }
        drop(state);

        log::debug!("timer.fire(): {}", handle);
        if sink.fire(handle, at) {
            Ok(())
        } else {
            Err(EngineError::Stopped)
        }
    }

    /// Fires every timer due at the current reading in `(scheduled time,
    /// handle)` order, periodic timers once per elapsed period. Returns the
    /// handles in fire order.
    pub fn fire_due(&self) -> Result<Vec<TimerHandle>, EngineError> {
        let mut fired = Vec::new();
        loop {
            let (now, due) = {
                let state = self.state();
                (state.now, state.earliest_due())
            };
            let Some((_, handle)) = due else {
                return Ok(fired);
            };
            self.request_fire(handle, now)?;
            fired.push(handle);
        }
    }

    pub fn armed(&self) -> Vec<(TimerHandle, Timestamp)> {
        self.state().armed.iter().map(|(h, timer)| (*h, timer.at)).collect()
    }
}

impl TimerSource for VirtualClock {
    fn now(&self) -> Timestamp {
        self.state().now
    }

    fn bind(&self, sink: Arc<dyn FireSink>) {
        self.state().sink = Some(sink);
    }

    fn arm(&self, handle: TimerHandle, at: Timestamp, interval: Option<Duration>) {
        let mut state = self.state();
        log::debug!("new fake timer: {}, {}", handle, at.saturating_since(state.now).as_millis());
        state.armed.insert(handle, ArmedTimer { at, interval });
    }

    fn disarm(&self, handle: TimerHandle) {
        self.state().armed.remove(&handle);
    }

    fn shutdown(&self) {
        let mut state = self.state();
        state.armed.clear();
        state.sink = None;
    }
}
