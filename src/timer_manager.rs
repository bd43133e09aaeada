use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    clock::{TimerHandle, TimerSource, Timestamp},
    error::{EngineError, UnmatchedReason},
    lifecycle::Lifecycle,
    rules::TimerCallback,
};

pub struct Timer {
    pub handle: TimerHandle,
    pub name: Option<String>,
    pub fire_at: Timestamp,
    /// `None` for one-shot timers.
    pub interval: Option<Duration>,
    callback: Option<TimerCallback>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("fire_at", &self.fire_at)
            .field("interval", &self.interval)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Outcome of [`TimerRegistry::fire`], handed to the rule lane.
pub struct FiredTimer {
    pub handle: TimerHandle,
    pub name: Option<String>,
    pub scheduled: Timestamp,
    /// Next fire time of a periodic timer.
    pub next: Option<Timestamp>,
    pub callback: Option<TimerCallback>,
}

impl fmt::Debug for FiredTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiredTimer")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("scheduled", &self.scheduled)
            .field("next", &self.next)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl FiredTimer {
    pub fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("timer {} [{}]", self.handle, name),
            None => format!("timer {}", self.handle),
        }
    }
}

struct TimerTable {
    next_handle: u64,
    timers: BTreeMap<TimerHandle, Timer>,
    names: HashMap<String, TimerHandle>,
}

impl TimerTable {
    fn remove(&mut self, handle: TimerHandle) -> Option<Timer> {
        let timer = self.timers.remove(&handle)?;
        if let Some(name) = &timer.name {
            if self.names.get(name) == Some(&handle) {
                self.names.remove(name);
            }
        }
        Some(timer)
    }
}

/// Tracks every timer of one engine instance.
#[derive(Clone)]
pub struct TimerRegistry {
    table: Arc<Mutex<TimerTable>>,
    clock: Arc<dyn TimerSource>,
    lifecycle: Lifecycle,
}

impl TimerRegistry {
    pub fn new(clock: Arc<dyn TimerSource>, lifecycle: Lifecycle) -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable {
                next_handle: 1,
                timers: BTreeMap::new(),
                names: HashMap::new(),
            })),
            clock,
            lifecycle,
        }
    }

    fn table(&self) -> MutexGuard<'_, TimerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Creates a timer firing `delay` from now, then every `interval` if one is
    /// given and non-zero. A named timer replaces an active timer of the same
    /// name.
    pub fn create_timer(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        name: Option<&str>,
        callback: Option<TimerCallback>,
    ) -> Result<TimerHandle, EngineError> {
        if !self.lifecycle.is_ready() {
            return Err(EngineError::NotReady);
        }
        let interval = interval.filter(|i| !i.is_zero());

        let mut table = self.table();
        if let Some(name) = name {
            if let Some(previous) = table.names.get(name).copied() {
                table.remove(previous);
                self.clock.disarm(previous);
                log::debug!("Timer {} [{}] replaced.", previous, name);
            }
        }

        let handle = TimerHandle(table.next_handle);
        table.next_handle += 1;
        let fire_at = self.clock.now() + delay;

        if let Some(name) = name {
            table.names.insert(name.to_string(), handle);
        }
        table.timers.insert(
            handle,
            Timer {
                handle,
                name: name.map(str::to_string),
                fire_at,
                interval,
                callback,
            },
        );
        self.clock.arm(handle, fire_at, interval);
        log::debug!(
            "Timer {} created with delay {:?}{}",
            handle,
            delay,
            interval.map(|i| format!(", repeating every {:?}", i)).unwrap_or_default()
        );
        Ok(handle)
    }

    /// Cancels a timer. Unknown, fired or already cancelled handles are a no-op.
    pub fn cancel_timer(&self, handle: TimerHandle) {
        if self.table().remove(handle).is_some() {
            self.clock.disarm(handle);
            log::debug!("Timer {} cancelled.", handle);
        }
    }

    /// Cancels the active timer called `name`, if any.
    pub fn cancel_named(&self, name: &str) {
        let handle = self.table().names.get(name).copied();
        if let Some(handle) = handle {
            self.cancel_timer(handle);
        }
    }

    pub fn handle_by_name(&self, name: &str) -> Option<TimerHandle> {
        self.table().names.get(name).copied()
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.table().timers.contains_key(&handle)
    }

    pub fn scheduled_at(&self, handle: TimerHandle) -> Option<Timestamp> {
        self.table().timers.get(&handle).map(|t| t.fire_at)
    }

    pub fn len(&self) -> usize {
        self.table().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires `handle` at `at`. A one-shot timer leaves the registry; a periodic
    /// one moves on to its scheduled time plus the interval, the clock has
    /// already re-armed it.
    pub fn fire(&self, handle: TimerHandle, at: Timestamp) -> Result<FiredTimer, EngineError> {
        let mut table = self.table();
        let unmatched = |reason| EngineError::UnmatchedFireRequest { handle, at, reason };
        let Some(timer) = table.timers.get_mut(&handle) else {
            return Err(unmatched(UnmatchedReason::UnknownTimer));
        };
        if timer.fire_at > at {
            return Err(unmatched(UnmatchedReason::NotDue {
                scheduled: timer.fire_at,
            }));
        }

        let scheduled = timer.fire_at;
        let next = timer.interval.and_then(|interval| {
            let next = scheduled.checked_add(interval);
            if next.is_none() {
                log::warn!("Timer {} cannot repeat after {}, firing it one last time", handle, scheduled);
            }
            next
        });
        match next {
            Some(next) => {
                timer.fire_at = next;
                Ok(FiredTimer {
                    handle,
                    name: timer.name.clone(),
                    scheduled,
                    next: Some(next),
                    callback: timer.callback.clone(),
                })
            }
            None => {
                self.clock.disarm(handle);
                let timer = table.remove(handle).ok_or(unmatched(UnmatchedReason::UnknownTimer))?;
                Ok(FiredTimer {
                    handle,
                    name: timer.name,
                    scheduled,
                    next: None,
                    callback: timer.callback,
                })
            }
        }
    }

    pub fn clear(&self) {
        log::debug!("Removing all timers");
        let mut table = self.table();
        for (handle, _) in std::mem::take(&mut table.timers) {
            self.clock.disarm(handle);
        }
        table.names.clear();
    }
}
