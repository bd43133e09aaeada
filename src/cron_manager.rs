use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ScheduledCron {
    pub rule_index: usize,
    pub handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronEvent {
    pub rule_index: usize,
    /// Rule set generation the schedule belongs to. Events of replaced rule
    /// sets are dropped by the lane.
    pub generation: u64,
}

/// Receiver of due cron schedules.
pub trait CronSink: Send + Sync {
    /// Returns `false` once the receiving side is gone.
    fn cron_due(&self, event: CronEvent) -> bool;
}

#[derive(Clone)]
pub struct CronManager {
    cron_schedules: Arc<Mutex<HashMap<usize, ScheduledCron>>>,
    sink: Arc<dyn CronSink>,
}

impl CronManager {
    pub fn new(sink: Arc<dyn CronSink>) -> Self {
        Self {
            cron_schedules: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    fn schedules(&self) -> MutexGuard<'_, HashMap<usize, ScheduledCron>> {
        self.cron_schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the schedule of a cron rule. Invalid expressions are logged and
    /// never fire.
    pub fn schedule_cron(&self, rule_index: usize, generation: u64, cron_schedule: &str) {
        // cancel existing schedule for the rule if it exists
        self.cancel_cron_schedule(rule_index);

        let schedule = match Schedule::from_str(cron_schedule) {
            Ok(schedule) => schedule,
            Err(err) => {
                log::error!("Invalid cron expression: [{}] - 7 fields required, like [* * * * * * *] (sec, min, hour, day of month, month, day of week, year): {}", cron_schedule, err);
                return;
            }
        };

        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            for next in schedule.upcoming(Utc) {
                let now: DateTime<Utc> = SystemTime::now().into();
                let delay = (next - now)
                    .to_std()
                    .unwrap_or_else(|_| std::time::Duration::from_secs(0));

                log::debug!("cron rule {} - next execution at: {}", rule_index, next.with_timezone(&Local));
                tokio::time::sleep(delay).await;

                if !sink.cron_due(CronEvent { rule_index, generation }) {
                    log::debug!("cron rule {} - rule lane is gone, stopping schedule", rule_index);
                    break;
                }
            }
        });

        self.schedules().insert(rule_index, ScheduledCron { rule_index, handle });
    }

    pub fn cancel_cron_schedule(&self, rule_index: usize) {
        if let Some(schedule) = self.schedules().remove(&rule_index) {
            schedule.handle.abort();
            log::debug!("Schedule for cron rule {} cancelled.", schedule.rule_index);
        }
    }

    pub fn len(&self) -> usize {
        self.schedules().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        log::debug!("Removing all cron schedules");
        for (_, schedule) in self.schedules().drain() {
            schedule.handle.abort();
        }
    }
}
