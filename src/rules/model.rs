use std::{fmt, sync::Arc};

use color_eyre::eyre::Result;

use super::RuleContext;
use crate::{
    clock::TimerHandle,
    device_model::{ControlChange, ControlRef},
};

/// Body of a rule, run with the event that triggered it.
pub type RuleCallback = Arc<dyn Fn(&RuleContext<'_>, &RuleTriggerEvent) -> Result<()> + Send + Sync>;

/// Callback attached to a timer created with `set_timeout`/`set_interval`.
pub type TimerCallback = Arc<dyn Fn(&RuleContext<'_>) -> Result<()> + Send + Sync>;

/// Load-time callback, run once the engine is ready.
pub type InitCallback = Arc<dyn Fn(&RuleContext<'_>) -> Result<()> + Send + Sync>;

pub type Condition = Arc<dyn Fn(&RuleContext<'_>) -> bool + Send + Sync>;

pub enum RuleTrigger {
    /// Runs when one of the controls changes its value.
    WhenChanged(Vec<ControlRef>),
    /// Runs on every evaluation in which the condition holds.
    When(Condition),
    /// Runs when the condition turns from false to true.
    AsSoonAs(Condition),
    /// Runs on a 7 field cron schedule (sec min hour dom month dow year), UTC.
    Cron(String),
}

impl fmt::Debug for RuleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleTrigger::WhenChanged(controls) => f.debug_tuple("WhenChanged").field(controls).finish(),
            RuleTrigger::When(_) => f.write_str("When(..)"),
            RuleTrigger::AsSoonAs(_) => f.write_str("AsSoonAs(..)"),
            RuleTrigger::Cron(schedule) => f.debug_tuple("Cron").field(schedule).finish(),
        }
    }
}

pub struct Rule {
    pub name: String,
    pub trigger: RuleTrigger,
    pub then: RuleCallback,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl Rule {
    pub fn new<F>(name: impl Into<String>, trigger: RuleTrigger, then: F) -> Self
    where
        F: Fn(&RuleContext<'_>, &RuleTriggerEvent) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            trigger,
            then: Arc::new(then),
        }
    }

    pub fn when_changed<F>(name: impl Into<String>, controls: impl IntoIterator<Item = ControlRef>, then: F) -> Self
    where
        F: Fn(&RuleContext<'_>, &RuleTriggerEvent) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, RuleTrigger::WhenChanged(controls.into_iter().collect()), then)
    }

    pub fn when<C, F>(name: impl Into<String>, condition: C, then: F) -> Self
    where
        C: Fn(&RuleContext<'_>) -> bool + Send + Sync + 'static,
        F: Fn(&RuleContext<'_>, &RuleTriggerEvent) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, RuleTrigger::When(Arc::new(condition)), then)
    }

    pub fn as_soon_as<C, F>(name: impl Into<String>, condition: C, then: F) -> Self
    where
        C: Fn(&RuleContext<'_>) -> bool + Send + Sync + 'static,
        F: Fn(&RuleContext<'_>, &RuleTriggerEvent) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, RuleTrigger::AsSoonAs(Arc::new(condition)), then)
    }

    pub fn cron<F>(name: impl Into<String>, schedule: impl Into<String>, then: F) -> Self
    where
        F: Fn(&RuleContext<'_>, &RuleTriggerEvent) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, RuleTrigger::Cron(schedule.into()), then)
    }
}

/// What made a rule run.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleTriggerEvent {
    /// Evaluation right after the engine became ready.
    Initial,
    ControlChanged(ControlChange),
    Timer {
        handle: TimerHandle,
        name: Option<String>,
    },
    Cron,
}

impl RuleTriggerEvent {
    pub fn trigger_type(&self) -> &'static str {
        match self {
            RuleTriggerEvent::Initial => "initial",
            RuleTriggerEvent::ControlChanged(_) => "control_changed",
            RuleTriggerEvent::Timer { .. } => "timer",
            RuleTriggerEvent::Cron => "cron",
        }
    }

    pub fn control_change(&self) -> Option<&ControlChange> {
        match self {
            RuleTriggerEvent::ControlChanged(change) => Some(change),
            _ => None,
        }
    }

    pub fn timer_name(&self) -> Option<&str> {
        match self {
            RuleTriggerEvent::Timer { name, .. } => name.as_deref(),
            _ => None,
        }
    }
}

/// Rules and load-time callbacks of one rule source, installed as a unit.
#[derive(Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub init: Vec<InitCallback>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Registers code that runs once the engine is ready, e.g. to start
    /// timers at load time.
    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.init.push(Arc::new(callback));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.init.is_empty()
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("rules", &self.rules)
            .field("init", &self.init.len())
            .finish()
    }
}
