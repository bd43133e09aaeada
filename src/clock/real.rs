use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{FireSink, TimerHandle, TimerSource, Timestamp};

#[derive(Debug)]
enum ClockCommand {
    Arm(TimerHandle, Timestamp, Option<Duration>),
    Disarm(TimerHandle),
}

/// Wall-clock time source. One driver task sleeps until the earliest entry of
/// a `(fire time, handle)` ordered schedule, so coincident timers fire in
/// creation order.
pub struct RealClock {
    epoch: Instant,
    commands: Mutex<Option<mpsc::UnboundedSender<ClockCommand>>>,
    cancel: CancellationToken,
}

impl RealClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            commands: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn send(&self, command: ClockCommand) {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        match commands.as_ref() {
            Some(sender) => {
                if let Err(err) = sender.send(command) {
                    log::warn!("Clock driver is gone, dropping command: {:?}", err.0);
                }
            }
            None => log::warn!("Clock is not bound to a rule lane, dropping command: {:?}", command),
        }
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerSource for RealClock {
    fn now(&self) -> Timestamp {
        Timestamp::from(self.epoch.elapsed())
    }

    fn bind(&self, sink: Arc<dyn FireSink>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.commands.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        tokio::spawn(run_clock_driver(self.epoch, receiver, sink, self.cancel.clone()));
    }

    fn arm(&self, handle: TimerHandle, at: Timestamp, interval: Option<Duration>) {
        self.send(ClockCommand::Arm(handle, at, interval));
    }

    fn disarm(&self, handle: TimerHandle) {
        self.send(ClockCommand::Disarm(handle));
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn run_clock_driver(
    epoch: Instant,
    mut commands: mpsc::UnboundedReceiver<ClockCommand>,
    sink: Arc<dyn FireSink>,
    cancel: CancellationToken,
) {
    let mut schedule: BTreeSet<(Timestamp, TimerHandle)> = BTreeSet::new();
    let mut armed: HashMap<TimerHandle, (Timestamp, Option<Duration>)> = HashMap::new();

    loop {
        let next = schedule.first().copied();
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(ClockCommand::Arm(handle, at, interval)) => {
                    if let Some((previous, _)) = armed.insert(handle, (at, interval)) {
                        schedule.remove(&(previous, handle));
                    }
                    schedule.insert((at, handle));
                }
                Some(ClockCommand::Disarm(handle)) => {
                    if let Some((previous, _)) = armed.remove(&handle) {
                        schedule.remove(&(previous, handle));
                    }
                }
                None => break,
            },
            _ = sleep_until_next(epoch, next) => {
                if let Some((at, handle)) = next {
                    schedule.remove(&(at, handle));
                    let interval = armed.remove(&handle).and_then(|(_, interval)| interval);
                    if let Some(next_at) = interval.and_then(|i| at.checked_add(i)) {
                        armed.insert(handle, (next_at, interval));
                        schedule.insert((next_at, handle));
                    }
                    log::trace!("Clock: timer {} due at {}", handle, at);
                    if !sink.fire(handle, at) {
                        break;
                    }
                }
            }
        }
    }
    log::trace!("Exiting clock driver...");
}

async fn sleep_until_next(epoch: Instant, next: Option<(Timestamp, TimerHandle)>) {
    // a deadline past what `Instant` can hold is never reached
    match next.and_then(|(at, _)| epoch.checked_add(at.as_duration())) {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(TimerHandle, Timestamp)>>);

    impl FireSink for Recorder {
        fn fire(&self, handle: TimerHandle, at: Timestamp) -> bool {
            self.0.lock().unwrap().push((handle, at));
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_time_then_creation_order() {
        let clock = RealClock::new();
        let recorder = Arc::new(Recorder::default());
        clock.bind(recorder.clone());

        clock.arm(TimerHandle(2), Timestamp::from_millis(100), None);
        clock.arm(TimerHandle(1), Timestamp::from_millis(100), None);
        clock.arm(TimerHandle(3), Timestamp::from_millis(50), None);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let fired = recorder.0.lock().unwrap().clone();
        assert_eq!(
            fired,
            vec![
                (TimerHandle(3), Timestamp::from_millis(50)),
                (TimerHandle(1), Timestamp::from_millis(100)),
                (TimerHandle(2), Timestamp::from_millis(100)),
            ]
        );
        clock.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let clock = RealClock::new();
        let recorder = Arc::new(Recorder::default());
        clock.bind(recorder.clone());

        clock.arm(TimerHandle(1), Timestamp::from_millis(100), None);
        clock.disarm(TimerHandle(1));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(recorder.0.lock().unwrap().is_empty());
        clock.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_deadline_does_not_stall_other_timers() {
        let clock = RealClock::new();
        let recorder = Arc::new(Recorder::default());
        clock.bind(recorder.clone());

        clock.arm(TimerHandle(1), Timestamp::ZERO + Duration::MAX, None);
        clock.arm(TimerHandle(2), Timestamp::from_millis(1000), None);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(TimerHandle(2), Timestamp::from_millis(1000))]
        );
        clock.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_rearms_itself() {
        let clock = RealClock::new();
        let recorder = Arc::new(Recorder::default());
        clock.bind(recorder.clone());

        clock.arm(TimerHandle(1), Timestamp::from_millis(100), Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(350)).await;

        let fired = recorder.0.lock().unwrap().iter().map(|(_, at)| at.as_millis()).collect::<Vec<_>>();
        assert_eq!(fired, vec![100, 200, 300]);
        clock.shutdown();
    }
}
