use hc_rules_engine::rules::RuleSet;

/// Rules compiled into the service binary.
pub fn builtin_rules() -> RuleSet {
    RuleSet::new().on_ready(|ctx| {
        ctx.log().info(format!("Rule engine started at {}", ctx.now()));
        Ok(())
    })
}
