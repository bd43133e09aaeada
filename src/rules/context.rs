use std::{
    cell::RefCell,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use color_eyre::eyre::Result;

use crate::{
    clock::{TimerHandle, Timestamp},
    device_model::{Control, ControlRef, DeviceModel},
    error::EngineError,
    timer_manager::TimerRegistry,
    topics::{control_on_topic, rule_log_topic},
    transport::{OutgoingMessage, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleLogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl RuleLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleLogLevel::Debug => "debug",
            RuleLogLevel::Info => "info",
            RuleLogLevel::Warning => "warning",
            RuleLogLevel::Error => "error",
        }
    }
}

impl From<RuleLogLevel> for log::Level {
    fn from(level: RuleLogLevel) -> Self {
        match level {
            RuleLogLevel::Debug => log::Level::Debug,
            RuleLogLevel::Info => log::Level::Info,
            RuleLogLevel::Warning => log::Level::Warn,
            RuleLogLevel::Error => log::Level::Error,
        }
    }
}

/// Log output of rule code. Lines go to the process log and to
/// `/<device>/log/<level>`; debug lines only while rule debugging is on.
#[derive(Clone)]
pub struct RuleLogger {
    device_id: String,
    debug: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
}

impl RuleLogger {
    pub fn new(device_id: impl Into<String>, debug: Arc<AtomicBool>, transport: Arc<dyn Transport>) -> Self {
        Self {
            device_id: device_id.into(),
            debug,
            transport,
        }
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn log(&self, level: RuleLogLevel, message: impl AsRef<str>) {
        if level == RuleLogLevel::Debug && !self.debug_enabled() {
            return;
        }
        let message = message.as_ref();
        log::log!(log::Level::from(level), "{}", message);
        let topic = rule_log_topic(&self.device_id, level.as_str());
        if let Err(err) = self.transport.publish(OutgoingMessage::transient(topic, message)) {
            log::warn!("Cannot publish rule log line: {}", err);
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(RuleLogLevel::Debug, message)
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(RuleLogLevel::Info, message)
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(RuleLogLevel::Warning, message)
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(RuleLogLevel::Error, message)
    }
}

/// Everything rule code may touch while it runs on the rule lane.
pub struct RuleContext<'a> {
    model: &'a DeviceModel,
    timers: &'a TimerRegistry,
    transport: &'a dyn Transport,
    logger: &'a RuleLogger,
    firing_timer: Option<&'a str>,
    /// Controls read without a known type and value.
    incomplete_reads: RefCell<Vec<ControlRef>>,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(
        model: &'a DeviceModel,
        timers: &'a TimerRegistry,
        transport: &'a dyn Transport,
        logger: &'a RuleLogger,
    ) -> Self {
        Self {
            model,
            timers,
            transport,
            logger,
            firing_timer: None,
            incomplete_reads: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn with_firing_timer(mut self, name: Option<&'a str>) -> Self {
        self.firing_timer = name;
        self
    }

    pub fn model(&self) -> &'a DeviceModel {
        self.model
    }

    pub(crate) fn take_incomplete_reads(&self) -> Vec<ControlRef> {
        std::mem::take(&mut *self.incomplete_reads.borrow_mut())
    }

    pub fn control(&self, control: &ControlRef) -> Option<&'a Control> {
        let found = self.model.control(control);
        if !found.is_some_and(Control::is_complete) {
            self.incomplete_reads.borrow_mut().push(control.clone());
        }
        found
    }

    pub fn value(&self, control: &ControlRef) -> Option<&'a str> {
        self.control(control)?.value.as_deref()
    }

    pub fn bool_value(&self, control: &ControlRef) -> Option<bool> {
        match self.value(control)? {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    pub fn number_value(&self, control: &ControlRef) -> Option<f64> {
        self.value(control)?.parse().ok()
    }

    /// Requests a new value for a control by publishing to its `/on` topic.
    pub fn set_value(&self, control: &ControlRef, value: impl Display) -> Result<(), EngineError> {
        let topic = control_on_topic(&control.device, &control.control);
        self.transport
            .publish(OutgoingMessage::transient(topic, value.to_string()))?;
        Ok(())
    }

    pub fn now(&self) -> Timestamp {
        self.timers.now()
    }

    /// Starts (or restarts) a named one-shot timer. Rules see it firing
    /// through [`timer_firing`](Self::timer_firing).
    pub fn start_timer(&self, name: &str, delay: Duration) -> Result<TimerHandle, EngineError> {
        self.timers.create_timer(delay, None, Some(name), None)
    }

    /// Starts (or restarts) a named periodic timer.
    pub fn start_ticker(&self, name: &str, interval: Duration) -> Result<TimerHandle, EngineError> {
        self.timers.create_timer(interval, Some(interval), Some(name), None)
    }

    pub fn stop_timer(&self, name: &str) {
        self.timers.cancel_named(name)
    }

    /// `true` while rules are evaluated because the named timer fired.
    pub fn timer_firing(&self, name: &str) -> bool {
        self.firing_timer == Some(name)
    }

    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> Result<TimerHandle, EngineError>
    where
        F: Fn(&RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.timers.create_timer(delay, None, None, Some(Arc::new(callback)))
    }

    pub fn set_interval<F>(&self, interval: Duration, callback: F) -> Result<TimerHandle, EngineError>
    where
        F: Fn(&RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.timers
            .create_timer(interval, Some(interval), None, Some(Arc::new(callback)))
    }

    pub fn clear_timer(&self, handle: TimerHandle) {
        self.timers.cancel_timer(handle)
    }

    pub fn log(&self) -> &'a RuleLogger {
        self.logger
    }
}
