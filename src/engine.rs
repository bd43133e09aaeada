//! The rule lane: one task that owns the device model and the installed rules
//! and dispatches every invocation (transport messages, timer fires, cron
//! schedules, reloads) strictly one after another.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{FireSink, RealClock, TimerHandle, TimerSource, Timestamp},
    cron_manager::{CronEvent, CronManager, CronSink},
    debug_control::DebugControl,
    device_model::DeviceModel,
    error::EngineError,
    lifecycle::{Lifecycle, ReadinessState, ReadySignal},
    rules::{run_guarded, ActiveRules, RuleContext, RuleLogger, RuleSet, RuleTriggerEvent},
    settings::EngineSettings,
    timer_manager::TimerRegistry,
    topics::SubscriptionSet,
    transport::{IncomingMessage, Transport},
};

#[derive(Debug)]
enum Invocation {
    Message(IncomingMessage),
    BrokerReady,
    TimerFired { handle: TimerHandle, at: Timestamp },
    Cron(CronEvent),
    ReloadRules(RuleSet),
    Barrier(oneshot::Sender<()>),
}

impl Invocation {
    fn name(&self) -> &'static str {
        match self {
            Invocation::Message(_) => "message",
            Invocation::BrokerReady => "broker ready",
            Invocation::TimerFired { .. } => "timer fire",
            Invocation::Cron(_) => "cron",
            Invocation::ReloadRules(_) => "reload",
            Invocation::Barrier(_) => "barrier",
        }
    }
}

#[derive(Clone)]
struct InvocationSender(mpsc::UnboundedSender<Invocation>);

impl InvocationSender {
    fn send(&self, invocation: Invocation) -> Result<(), EngineError> {
        self.0.send(invocation).map_err(|_| EngineError::Stopped)
    }
}

impl FireSink for InvocationSender {
    fn fire(&self, handle: TimerHandle, at: Timestamp) -> bool {
        self.0.send(Invocation::TimerFired { handle, at }).is_ok()
    }
}

impl CronSink for InvocationSender {
    fn cron_due(&self, event: CronEvent) -> bool {
        self.0.send(Invocation::Cron(event)).is_ok()
    }
}

struct RuleEnv {
    model: DeviceModel,
    timers: TimerRegistry,
    transport: Arc<dyn Transport>,
    logger: RuleLogger,
}

impl RuleEnv {
    fn context(&self) -> RuleContext<'_> {
        RuleContext::new(&self.model, &self.timers, self.transport.as_ref(), &self.logger)
    }
}

pub struct EngineBuilder {
    settings: EngineSettings,
    transport: Arc<dyn Transport>,
    clock: Option<Arc<dyn TimerSource>>,
    rules: RuleSet,
}

impl EngineBuilder {
    /// Time source for timers, [`RealClock`] if not set.
    pub fn clock(mut self, clock: impl TimerSource + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Spawns the rule lane on the current tokio runtime. The engine stays
    /// `Idle` until [`EngineHandle::start`] is called.
    pub fn spawn(self) -> EngineHandle {
        let lifecycle = Lifecycle::new();
        let clock = self.clock.unwrap_or_else(|| Arc::new(RealClock::new()));
        let (sender, receiver) = mpsc::unbounded_channel();
        let invocations = InvocationSender(sender);

        clock.bind(Arc::new(invocations.clone()));
        let timers = TimerRegistry::new(clock.clone(), lifecycle.clone());
        let cron = CronManager::new(Arc::new(invocations.clone()));
        let debug = DebugControl::new(&self.settings);
        let logger = RuleLogger::new(self.settings.device_id.clone(), debug.flag(), self.transport.clone());

        let engine = Engine {
            env: RuleEnv {
                model: DeviceModel::new(),
                timers: timers.clone(),
                transport: self.transport.clone(),
                logger,
            },
            rules: ActiveRules::new(self.rules),
            generation: 0,
            deferred: VecDeque::new(),
            cron,
            clock,
            debug,
            lifecycle: lifecycle.clone(),
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(receiver, cancel.clone()));

        EngineHandle {
            invocations,
            lifecycle,
            timers,
            transport: self.transport,
            subscriptions: SubscriptionSet::new(),
            cancel,
            task: Some(task),
        }
    }
}

pub struct Engine {
    env: RuleEnv,
    rules: ActiveRules,
    /// Bumped on every reload, stale cron events are dropped.
    generation: u64,
    /// Invocations that must wait for `Ready`.
    deferred: VecDeque<Invocation>,
    cron: CronManager,
    clock: Arc<dyn TimerSource>,
    debug: DebugControl,
    lifecycle: Lifecycle,
}

impl Engine {
    pub fn builder(settings: EngineSettings, transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder {
            settings,
            transport,
            clock: None,
            rules: RuleSet::new(),
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Invocation>, cancel: CancellationToken) {
        log::debug!("Rule lane started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                invocation = receiver.recv() => match invocation {
                    Some(invocation) => {
                        let name = invocation.name();
                        if catch_unwind(AssertUnwindSafe(|| self.dispatch(invocation))).is_err() {
                            log::error!("Rule lane recovered from a panic while handling {}", name);
                        }
                    }
                    None => break,
                },
            }
        }
        self.shutdown();
        log::debug!("Rule lane stopped");
    }

    fn waits_for_ready(&self, invocation: &Invocation) -> bool {
        match invocation {
            Invocation::TimerFired { .. } | Invocation::Cron(_) => true,
            Invocation::Message(message) => message.topic == self.debug.on_topic(),
            _ => false,
        }
    }

    fn dispatch(&mut self, invocation: Invocation) {
        if !self.lifecycle.is_ready() && self.waits_for_ready(&invocation) {
            log::debug!("Deferring {} until ready", invocation.name());
            self.deferred.push_back(invocation);
            return;
        }
        log::trace!("Dispatching {}", invocation.name());

        match invocation {
            Invocation::Message(message) => self.on_message(message),
            Invocation::BrokerReady => self.on_broker_ready(),
            Invocation::TimerFired { handle, at } => self.on_timer_fired(handle, at),
            Invocation::Cron(event) => self.on_cron(event),
            Invocation::ReloadRules(rules) => self.reload(rules),
            Invocation::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    fn on_message(&mut self, message: IncomingMessage) {
        if message.topic == self.debug.on_topic() {
            if let Err(err) = self.debug.handle_write(&message.payload, self.env.transport.as_ref()) {
                log::error!("Cannot update rule debugging: {}", err);
            }
            return;
        }
        if let Some(change) = self.env.model.apply(&message) {
            log::debug!("{} changed to [{}]", change.control, change.value);
            let ctx = self.env.context();
            self.rules.run_control_rules(&change, &ctx);
        }
    }

    fn on_broker_ready(&mut self) {
        if self.lifecycle.state() != ReadinessState::AwaitingMetadataSync {
            log::warn!("Ignoring broker ready signal in state {}", self.lifecycle.state());
            return;
        }
        let backlog = self.env.model.on_broker_ready();
        if !self.lifecycle.metadata_synced() {
            return;
        }
        log::info!("Rule engine ready");

        if let Err(err) = self.debug.announce(self.env.transport.as_ref()) {
            log::error!("Cannot publish rule engine settings device: {}", err);
        }
        self.activate_rules();

        let ctx = self.env.context();
        for change in backlog.iter() {
            self.rules.run_control_rules(change, &ctx);
        }

        let deferred = std::mem::take(&mut self.deferred);
        for invocation in deferred {
            self.dispatch(invocation);
        }
    }

    fn activate_rules(&mut self) {
        let ctx = self.env.context();
        self.rules.run_init(&ctx);
        for (index, schedule) in self.rules.cron_schedules() {
            self.cron.schedule_cron(index, self.generation, &schedule);
        }
        self.rules.run_condition_rules(&RuleTriggerEvent::Initial, &ctx);
    }

    fn on_timer_fired(&mut self, handle: TimerHandle, at: Timestamp) {
        let fired = match self.env.timers.fire(handle, at) {
            Ok(fired) => fired,
            Err(err) => {
                // cancelled or replaced after the request was queued
                log::debug!("Dropping fire request: {}", err);
                return;
            }
        };
        let origin = fired.describe();
        log::debug!("{} fired, scheduled at {}", origin, fired.scheduled);

        match &fired.callback {
            Some(callback) => {
                let ctx = self.env.context();
                let _ = run_guarded(&origin, || callback(&ctx));
            }
            None => {
                let ctx = self.env.context().with_firing_timer(fired.name.as_deref());
                let event = RuleTriggerEvent::Timer {
                    handle,
                    name: fired.name.clone(),
                };
                self.rules.run_condition_rules(&event, &ctx);
            }
        }
    }

    fn on_cron(&mut self, event: CronEvent) {
        if event.generation != self.generation {
            log::debug!("Dropping cron event of replaced rule set: {:?}", event);
            return;
        }
        let ctx = self.env.context();
        self.rules.run_cron_rule(event.rule_index, &ctx);
    }

    fn reload(&mut self, rules: RuleSet) {
        self.env.timers.clear();
        self.cron.clear();
        self.generation += 1;
        self.rules = ActiveRules::new(rules);
        log::info!("Installed {} rules", self.rules.len());
        if self.lifecycle.is_ready() {
            self.activate_rules();
        }
    }

    fn shutdown(&mut self) {
        self.env.timers.clear();
        self.cron.clear();
        self.clock.shutdown();
    }
}

/// Control surface of a running engine. Rule code always runs on the lane.
pub struct EngineHandle {
    invocations: InvocationSender,
    lifecycle: Lifecycle,
    timers: TimerRegistry,
    transport: Arc<dyn Transport>,
    subscriptions: SubscriptionSet,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Issues the subscription set and asks the transport to report when the
    /// retained backlog has been delivered. Returns without waiting.
    pub fn start(&self) -> Result<(), EngineError> {
        self.lifecycle.begin_start()?;
        for pattern in self.subscriptions.patterns() {
            self.transport.subscribe(pattern)?;
        }
        self.lifecycle.subscriptions_issued();
        self.transport.request_sync()?;
        Ok(())
    }

    pub fn state(&self) -> ReadinessState {
        self.lifecycle.state()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    pub fn ready(&self) -> ReadySignal {
        self.lifecycle.ready_signal()
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    pub fn deliver(&self, message: IncomingMessage) -> Result<(), EngineError> {
        self.invocations.send(Invocation::Message(message))
    }

    pub fn broker_ready(&self) -> Result<(), EngineError> {
        self.invocations.send(Invocation::BrokerReady)
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Creates a timer that triggers condition rule evaluation when it fires.
    pub fn create_timer(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        name: Option<&str>,
    ) -> Result<TimerHandle, EngineError> {
        self.timers.create_timer(delay, interval, name, None)
    }

    pub fn cancel_timer(&self, handle: TimerHandle) {
        self.timers.cancel_timer(handle)
    }

    pub fn reload_rules(&self, rules: RuleSet) -> Result<(), EngineError> {
        self.invocations.send(Invocation::ReloadRules(rules))
    }

    /// Resolves once everything enqueued before this call has been dispatched.
    pub async fn sync(&self) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.invocations.send(Invocation::Barrier(done))?;
        wait.await.map_err(|_| EngineError::Stopped)
    }

    /// Stops the lane, cancels every timer and schedule and waits for the lane
    /// task to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                log::error!("Rule lane terminated abnormally: {}", err);
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
