use std::panic::{catch_unwind, AssertUnwindSafe};

use color_eyre::eyre::Result;

use super::{Condition, InitCallback, Rule, RuleContext, RuleSet, RuleTrigger, RuleTriggerEvent};
use crate::{device_model::ControlChange, error::EngineError};

/// Runs rule code, turning a returned error or a panic into
/// [`EngineError::RuleCallbackFailure`]. The failure is logged here; callers
/// only need the result if they care.
pub fn run_guarded<F>(origin: &str, f: F) -> Result<(), EngineError>
where
    F: FnOnce() -> Result<()>,
{
    let message = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => format!("{:#}", err),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .map(|s| format!("panicked: {}", s))
            .unwrap_or_else(|| "panicked".to_string()),
    };
    let err = EngineError::RuleCallbackFailure {
        origin: origin.to_string(),
        message,
    };
    log::error!("{}", err);
    Err(err)
}

struct ActiveRule {
    rule: Rule,
    /// Last observed result of an `AsSoonAs` condition.
    last_condition: bool,
}

/// The currently installed rules with their edge-detection state.
#[derive(Default)]
pub struct ActiveRules {
    rules: Vec<ActiveRule>,
    init: Vec<InitCallback>,
}

impl ActiveRules {
    pub fn new(set: RuleSet) -> Self {
        Self {
            rules: set
                .rules
                .into_iter()
                .map(|rule| ActiveRule {
                    rule,
                    last_condition: false,
                })
                .collect(),
            init: set.init,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `(index, schedule)` of every cron rule.
    pub fn cron_schedules(&self) -> Vec<(usize, String)> {
        self.rules
            .iter()
            .enumerate()
            .filter_map(|(index, active)| match &active.rule.trigger {
                RuleTrigger::Cron(schedule) => Some((index, schedule.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn run_init(&self, ctx: &RuleContext<'_>) {
        for (index, init) in self.init.iter().enumerate() {
            let _ = run_guarded(&format!("init[{}]", index), || init(ctx));
        }
    }

    /// Runs the rules interested in a value change: `WhenChanged` rules naming
    /// the control, then the condition rules unless the change is a replay of
    /// retained state.
    pub fn run_control_rules(&mut self, change: &ControlChange, ctx: &RuleContext<'_>) {
        let event = RuleTriggerEvent::ControlChanged(change.clone());
        for active in self.rules.iter() {
            if let RuleTrigger::WhenChanged(controls) = &active.rule.trigger {
                if controls.contains(&change.control) {
                    run_rule(&active.rule, &event, ctx);
                }
            }
        }
        if !change.initial {
            self.run_condition_rules(&event, ctx);
        }
    }

    /// Evaluates `When` and `AsSoonAs` rules. `When` runs whenever its
    /// condition holds; `AsSoonAs` only on a false to true edge. A condition
    /// reading an incomplete control is skipped and keeps its edge state.
    pub fn run_condition_rules(&mut self, event: &RuleTriggerEvent, ctx: &RuleContext<'_>) {
        for active in self.rules.iter_mut() {
            match &active.rule.trigger {
                RuleTrigger::When(condition) => {
                    if evaluate(&active.rule.name, condition, ctx) == Some(true) {
                        run_rule(&active.rule, event, ctx);
                    }
                }
                RuleTrigger::AsSoonAs(condition) => {
                    let Some(current) = evaluate(&active.rule.name, condition, ctx) else {
                        continue;
                    };
                    let edge = current && !active.last_condition;
                    active.last_condition = current;
                    if edge {
                        run_rule(&active.rule, event, ctx);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn run_cron_rule(&self, index: usize, ctx: &RuleContext<'_>) {
        match self.rules.get(index) {
            Some(active) if matches!(active.rule.trigger, RuleTrigger::Cron(_)) => {
                run_rule(&active.rule, &RuleTriggerEvent::Cron, ctx);
            }
            _ => log::debug!("No cron rule at index {}", index),
        }
    }
}

fn evaluate(rule_name: &str, condition: &Condition, ctx: &RuleContext<'_>) -> Option<bool> {
    ctx.take_incomplete_reads();
    let value = match catch_unwind(AssertUnwindSafe(|| condition(ctx))) {
        Ok(value) => value,
        Err(_) => {
            log::error!("{} -- condition panicked, treating it as false", rule_name);
            false
        }
    };
    let incomplete = ctx.take_incomplete_reads();
    if let Some(control) = incomplete.first() {
        log::debug!("{} -- skipping rule due to incomplete control {}", rule_name, control);
        return None;
    }
    Some(value)
}

fn run_rule(rule: &Rule, event: &RuleTriggerEvent, ctx: &RuleContext<'_>) {
    log::debug!("{} -- rule triggered ({})", rule.name, event.trigger_type());
    if run_guarded(&rule.name, || (rule.then)(ctx, event)).is_ok() {
        log::debug!("{} -- rule finished", rule.name);
    }
}
