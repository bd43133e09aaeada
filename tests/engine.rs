use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use color_eyre::eyre::eyre;
use hc_rules_engine::{
    clock::{TimerHandle, Timestamp, VirtualClock},
    device_model::ControlRef,
    engine::{Engine, EngineHandle},
    error::{EngineError, UnmatchedReason},
    lifecycle::ReadinessState,
    rules::{Rule, RuleSet},
    settings::EngineSettings,
    transport::{mock::MockBroker, IncomingMessage},
};

fn spawn_engine(rules: RuleSet) -> (EngineHandle, MockBroker, VirtualClock) {
    let broker = MockBroker::new();
    let clock = VirtualClock::new();
    let engine = Engine::builder(EngineSettings::default(), Arc::new(broker.clone()))
        .clock(clock.clone())
        .rules(rules)
        .spawn();
    (engine, broker, clock)
}

async fn ready_engine(rules: RuleSet) -> (EngineHandle, MockBroker, VirtualClock) {
    let (engine, broker, clock) = spawn_engine(rules);
    engine.start().unwrap();
    engine.broker_ready().unwrap();
    engine.ready().wait().await.unwrap();
    engine.sync().await.unwrap();
    broker.take_recorded();
    (engine, broker, clock)
}

fn value(device: &str, control: &str, payload: &str) -> IncomingMessage {
    IncomingMessage::new(format!("/devices/{}/controls/{}", device, control), payload)
}

fn control_type(device: &str, control: &str, control_type: &str) -> IncomingMessage {
    IncomingMessage::new(
        format!("/devices/{}/controls/{}/meta/type", device, control),
        control_type,
    )
    .retained()
}

#[tokio::test]
async fn startup_publishes_settings_device_and_runs_timer() {
    let rules = RuleSet::new().on_ready(|ctx| {
        ctx.set_timeout(Duration::from_millis(1000), |ctx| {
            ctx.log().info("timer fired");
            Ok(())
        })?;
        Ok(())
    });
    let (engine, broker, clock) = spawn_engine(rules);
    assert_eq!(engine.state(), ReadinessState::Idle);

    engine.start().unwrap();
    assert_eq!(engine.state(), ReadinessState::AwaitingMetadataSync);
    broker.verify(&[
        "Subscribe -- driver: /devices/+/meta/name",
        "Subscribe -- driver: /devices/+/controls/+",
        "Subscribe -- driver: /devices/+/controls/+/meta/type",
        "Subscribe -- driver: /devices/+/controls/+/meta/max",
    ]);
    assert_eq!(broker.sync_requests(), 1);

    // nothing happens until the broker confirms the backlog
    engine.sync().await.unwrap();
    broker.verify_empty();
    assert!(clock.armed().is_empty());

    engine.broker_ready().unwrap();
    engine.ready().wait().await.unwrap();
    engine.sync().await.unwrap();
    broker.verify_unordered(&[
        "driver -> /devices/wbrules/meta/name: [Rule Engine Settings] (QoS 1, retained)",
        "driver -> /devices/wbrules/controls/Rule debugging/meta/type: [switch] (QoS 1, retained)",
        "driver -> /devices/wbrules/controls/Rule debugging/meta/order: [1] (QoS 1, retained)",
        "driver -> /devices/wbrules/controls/Rule debugging: [0] (QoS 1, retained)",
        "Subscribe -- driver: /devices/wbrules/controls/Rule debugging/on",
    ]);
    assert_eq!(clock.armed(), vec![(TimerHandle(1), Timestamp::from_millis(1000))]);

    let ts = clock.advance(Duration::from_millis(1000));
    clock.request_fire(TimerHandle(1), ts).unwrap();
    engine.sync().await.unwrap();
    broker.verify(&["driver -> /wbrules/log/info: [timer fired] (QoS 1)"]);
    broker.verify_empty();

    engine.stop().await;
}

#[tokio::test]
async fn settings_device_is_announced_in_order() {
    let (engine, broker, _) = spawn_engine(RuleSet::new());
    engine.start().unwrap();
    broker.take_recorded();
    engine.broker_ready().unwrap();
    engine.sync().await.unwrap();
    broker.verify(&[
        "driver -> /devices/wbrules/meta/name: [Rule Engine Settings] (QoS 1, retained)",
        "driver -> /devices/wbrules/controls/Rule debugging/meta/type: [switch] (QoS 1, retained)",
        "driver -> /devices/wbrules/controls/Rule debugging/meta/order: [1] (QoS 1, retained)",
        "driver -> /devices/wbrules/controls/Rule debugging: [0] (QoS 1, retained)",
        "Subscribe -- driver: /devices/wbrules/controls/Rule debugging/on",
    ]);
}

#[tokio::test]
async fn timers_cannot_be_created_before_ready() {
    let (engine, _, clock) = spawn_engine(RuleSet::new());
    let res = engine.create_timer(Duration::from_millis(10), None, None);
    assert!(matches!(res, Err(EngineError::NotReady)));

    engine.start().unwrap();
    let res = engine.create_timer(Duration::from_millis(10), None, Some("early"));
    assert!(matches!(res, Err(EngineError::NotReady)));
    assert!(clock.armed().is_empty());
    assert!(engine.timers().is_empty());
}

#[tokio::test]
async fn second_start_fails() {
    let (engine, broker, _) = spawn_engine(RuleSet::new());
    engine.start().unwrap();
    broker.take_recorded();
    assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
    broker.verify_empty();
}

#[tokio::test]
async fn broker_ready_before_start_is_ignored() {
    let (engine, broker, _) = spawn_engine(RuleSet::new());
    engine.broker_ready().unwrap();
    engine.sync().await.unwrap();
    assert_eq!(engine.state(), ReadinessState::Idle);
    broker.verify_empty();
}

#[tokio::test]
async fn buffered_changes_reach_rules_in_order_after_ready() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let rules = RuleSet::new().rule(Rule::when_changed(
        "relay watcher",
        [ControlRef::new("relay", "K1"), ControlRef::new("relay", "K2")],
        move |_, event| {
            let change = event.control_change().ok_or_else(|| eyre!("not a control change"))?;
            record
                .lock()
                .unwrap()
                .push(format!("{}={} initial={}", change.control, change.value, change.initial));
            Ok(())
        },
    ));
    let (engine, _, _) = spawn_engine(rules);
    engine.start().unwrap();

    engine.deliver(value("relay", "K1", "1").retained()).unwrap();
    engine.deliver(value("relay", "K2", "1").retained()).unwrap();
    engine.deliver(value("relay", "K1", "0")).unwrap();
    engine.sync().await.unwrap();
    assert!(seen.lock().unwrap().is_empty());

    engine.broker_ready().unwrap();
    engine.sync().await.unwrap();
    engine.deliver(value("relay", "K2", "0")).unwrap();
    engine.sync().await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "relay/K1=1 initial=true",
            "relay/K2=1 initial=true",
            "relay/K1=0 initial=true",
            "relay/K2=0 initial=false",
        ]
    );
}

#[tokio::test]
async fn coincident_timers_fire_in_creation_order() {
    let rules = RuleSet::new().on_ready(|ctx| {
        for name in ["T1", "T2", "T3"] {
            ctx.set_timeout(Duration::from_millis(1000), move |ctx| {
                ctx.log().info(name);
                Ok(())
            })?;
        }
        Ok(())
    });
    let (engine, broker, clock) = ready_engine(rules).await;

    clock.advance(Duration::from_millis(1000));
    let fired = clock.fire_due().unwrap();
    assert_eq!(fired, vec![TimerHandle(1), TimerHandle(2), TimerHandle(3)]);
    engine.sync().await.unwrap();
    broker.verify(&[
        "driver -> /wbrules/log/info: [T1] (QoS 1)",
        "driver -> /wbrules/log/info: [T2] (QoS 1)",
        "driver -> /wbrules/log/info: [T3] (QoS 1)",
    ]);
}

#[tokio::test]
async fn fire_requests_must_match_clock_and_schedule() {
    let rules = RuleSet::new().on_ready(|ctx| {
        ctx.set_timeout(Duration::from_millis(500), |_| Ok(()))?;
        Ok(())
    });
    let (_engine, _, clock) = ready_engine(rules).await;

    let err = clock.request_fire(TimerHandle(1), Timestamp::from_millis(500)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnmatchedFireRequest {
            reason: UnmatchedReason::ClockNotReached { .. },
            ..
        }
    ));

    let now = clock.advance(Duration::from_millis(400));
    let err = clock.request_fire(TimerHandle(1), now).unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnmatchedFireRequest {
            reason: UnmatchedReason::NotDue { .. },
            ..
        }
    ));

    let err = clock.request_fire(TimerHandle(7), now).unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnmatchedFireRequest {
            reason: UnmatchedReason::UnknownTimer,
            ..
        }
    ));
}

#[tokio::test]
async fn cancel_wins_over_queued_fire() {
    let rules = RuleSet::new().on_ready(|ctx| {
        ctx.set_timeout(Duration::from_millis(100), |ctx| {
            ctx.log().info("should not run");
            Ok(())
        })?;
        Ok(())
    });
    let (engine, broker, clock) = ready_engine(rules).await;

    let now = clock.advance(Duration::from_millis(100));
    clock.request_fire(TimerHandle(1), now).unwrap();
    // the lane has not picked up the fire request yet
    engine.cancel_timer(TimerHandle(1));
    engine.cancel_timer(TimerHandle(1));
    engine.sync().await.unwrap();
    broker.verify_empty();
    assert!(!engine.timers().is_active(TimerHandle(1)));
}

#[tokio::test]
async fn timer_cancelled_by_rule_never_fires() {
    let door = ControlRef::new("door", "open");
    let rules = RuleSet::new()
        .on_ready(|ctx| {
            ctx.set_timeout(Duration::from_millis(500), |ctx| {
                ctx.log().info("timeout ran");
                Ok(())
            })?;
            ctx.start_timer("door alarm", Duration::from_millis(500))?;
            Ok(())
        })
        .rule(Rule::when_changed("door closed", [door], |ctx, _| {
            ctx.clear_timer(TimerHandle(1));
            ctx.stop_timer("door alarm");
            Ok(())
        }))
        .rule(Rule::when(
            "door alarm",
            |ctx| ctx.timer_firing("door alarm"),
            |ctx, _| {
                ctx.log().info("alarm ran");
                Ok(())
            },
        ));
    let (engine, broker, clock) = ready_engine(rules).await;
    assert_eq!(clock.armed().len(), 2);

    clock.advance(Duration::from_millis(200));
    engine.deliver(value("door", "open", "0")).unwrap();
    engine.sync().await.unwrap();
    assert!(clock.armed().is_empty());

    let now = clock.advance(Duration::from_millis(1000));
    for handle in [TimerHandle(1), TimerHandle(2)] {
        let err = clock.request_fire(handle, now).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnmatchedFireRequest {
                reason: UnmatchedReason::UnknownTimer,
                ..
            }
        ));
    }
    assert!(clock.fire_due().unwrap().is_empty());
    engine.sync().await.unwrap();
    broker.verify_empty();
    assert!(engine.timers().is_empty());
}

#[tokio::test]
async fn restarting_a_named_timer_replaces_it() {
    let button = ControlRef::new("button", "press");
    let rules = RuleSet::new()
        .rule(Rule::when_changed("debounce start", [button], |ctx, _| {
            ctx.start_timer("debounce", Duration::from_millis(500))?;
            Ok(())
        }))
        .rule(Rule::when(
            "debounce elapsed",
            |ctx| ctx.timer_firing("debounce"),
            |ctx, event| {
                ctx.log().info(format!("debounce elapsed ({})", event.trigger_type()));
                Ok(())
            },
        ));
    let (engine, broker, clock) = ready_engine(rules).await;

    engine.deliver(value("button", "press", "1")).unwrap();
    engine.sync().await.unwrap();
    assert_eq!(clock.armed(), vec![(TimerHandle(1), Timestamp::from_millis(500))]);

    clock.advance(Duration::from_millis(300));
    engine.deliver(value("button", "press", "2")).unwrap();
    engine.sync().await.unwrap();
    assert_eq!(clock.armed(), vec![(TimerHandle(2), Timestamp::from_millis(800))]);
    assert_eq!(engine.timers().handle_by_name("debounce"), Some(TimerHandle(2)));

    let now = clock.advance(Duration::from_millis(500));
    assert!(clock.request_fire(TimerHandle(1), now).is_err());
    clock.request_fire(TimerHandle(2), now).unwrap();
    engine.sync().await.unwrap();
    broker.verify(&["driver -> /wbrules/log/info: [debounce elapsed (timer)] (QoS 1)"]);
    assert_eq!(engine.timers().handle_by_name("debounce"), None);
}

#[tokio::test]
async fn periodic_timer_keeps_its_cadence() {
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let record = ticks.clone();
    let rules = RuleSet::new().on_ready(move |ctx| {
        let record = record.clone();
        ctx.set_interval(Duration::from_millis(100), move |ctx| {
            record.lock().unwrap().push(ctx.now());
            Ok(())
        })?;
        Ok(())
    });
    let (engine, _, clock) = ready_engine(rules).await;

    // every fire is reported late, the schedule still stays on 100ms steps
    for n in 1..=3u64 {
        let now = clock.advance(Duration::from_millis(if n == 1 { 137 } else { 100 }));
        clock.request_fire(TimerHandle(1), now).unwrap();
        engine.sync().await.unwrap();
        assert_eq!(
            clock.armed(),
            vec![(TimerHandle(1), Timestamp::from_millis((n + 1) * 100))]
        );
    }
    assert_eq!(
        *ticks.lock().unwrap(),
        vec![
            Timestamp::from_millis(137),
            Timestamp::from_millis(237),
            Timestamp::from_millis(337)
        ]
    );
}

#[tokio::test]
async fn periodic_timer_catches_up_on_missed_periods() {
    let rules = RuleSet::new().on_ready(|ctx| {
        ctx.set_interval(Duration::from_millis(100), |ctx| {
            ctx.log().info("tick");
            Ok(())
        })?;
        Ok(())
    });
    let (engine, broker, clock) = ready_engine(rules).await;

    // both fires are requested before the lane picked up the first one
    let now = clock.advance(Duration::from_millis(300));
    clock.request_fire(TimerHandle(1), now).unwrap();
    clock.request_fire(TimerHandle(1), now).unwrap();
    assert_eq!(clock.fire_due().unwrap(), vec![TimerHandle(1)]);
    assert!(clock.fire_due().unwrap().is_empty());

    engine.sync().await.unwrap();
    broker.verify(&[
        "driver -> /wbrules/log/info: [tick] (QoS 1)",
        "driver -> /wbrules/log/info: [tick] (QoS 1)",
        "driver -> /wbrules/log/info: [tick] (QoS 1)",
    ]);
    assert_eq!(clock.armed(), vec![(TimerHandle(1), Timestamp::from_millis(400))]);
    assert_eq!(engine.timers().scheduled_at(TimerHandle(1)), Some(Timestamp::from_millis(400)));
}

#[tokio::test]
async fn periodic_timer_without_a_next_period_is_retired() {
    let interval = Duration::MAX - Duration::from_secs(1);
    let rules = RuleSet::new().on_ready(move |ctx| {
        ctx.set_interval(interval, |ctx| {
            ctx.log().info("last tick");
            Ok(())
        })?;
        Ok(())
    });
    let (engine, broker, clock) = ready_engine(rules).await;

    let now = clock.advance(interval);
    clock.request_fire(TimerHandle(1), now).unwrap();
    engine.sync().await.unwrap();
    broker.verify(&["driver -> /wbrules/log/info: [last tick] (QoS 1)"]);
    assert!(engine.timers().is_empty());
    assert!(clock.armed().is_empty());

    engine.deliver(value("sensor", "x", "1")).unwrap();
    engine.sync().await.unwrap();
    assert!(engine.is_ready());
}

#[tokio::test]
async fn failing_rules_do_not_stop_the_lane() {
    let sensor = ControlRef::new("sensor", "x");
    let rules = RuleSet::new()
        .rule(Rule::when_changed("broken", [sensor.clone()], |_, _| Err(eyre!("broken rule"))))
        .rule(Rule::when_changed("panicking", [sensor.clone()], |_, _| panic!("rule panicked")))
        .rule(Rule::when_changed("healthy", [sensor], |ctx, _| {
            ctx.log().info("still alive");
            Ok(())
        }));
    let (engine, broker, _) = ready_engine(rules).await;

    engine.deliver(value("sensor", "x", "1")).unwrap();
    engine.deliver(value("sensor", "x", "2")).unwrap();
    engine.sync().await.unwrap();
    broker.verify(&[
        "driver -> /wbrules/log/info: [still alive] (QoS 1)",
        "driver -> /wbrules/log/info: [still alive] (QoS 1)",
    ]);
    assert!(engine.is_ready());
}

#[tokio::test]
async fn debug_toggle_gates_rule_debug_output() {
    let rules = RuleSet::new().rule(Rule::when_changed("chatty", [ControlRef::new("a", "b")], |ctx, _| {
        ctx.log().debug("dbg");
        Ok(())
    }));
    let (engine, broker, _) = ready_engine(rules).await;

    engine.deliver(value("a", "b", "1")).unwrap();
    engine.sync().await.unwrap();
    broker.verify_empty();

    engine
        .deliver(IncomingMessage::new("/devices/wbrules/controls/Rule debugging/on", "1"))
        .unwrap();
    engine.deliver(value("a", "b", "2")).unwrap();
    engine.sync().await.unwrap();
    broker.verify(&[
        "driver -> /devices/wbrules/controls/Rule debugging: [1] (QoS 1, retained)",
        "driver -> /wbrules/log/debug: [dbg] (QoS 1)",
    ]);
}

#[tokio::test]
async fn as_soon_as_fires_on_rising_edge_only() {
    let temp = ControlRef::new("room", "temperature");
    let condition_temp = temp.clone();
    let rules = RuleSet::new().rule(Rule::as_soon_as(
        "too hot",
        move |ctx| ctx.number_value(&condition_temp).is_some_and(|t| t > 30.0),
        |ctx, _| {
            ctx.set_value(&ControlRef::new("fan", "power"), 1)?;
            Ok(())
        },
    ));
    let (engine, broker, _) = ready_engine(rules).await;

    engine.deliver(control_type("room", "temperature", "temperature")).unwrap();
    for reading in ["25", "31", "35", "20", "32"] {
        engine.deliver(value("room", "temperature", reading)).unwrap();
    }
    engine.sync().await.unwrap();
    broker.verify(&[
        "driver -> /devices/fan/controls/power/on: [1] (QoS 1)",
        "driver -> /devices/fan/controls/power/on: [1] (QoS 1)",
    ]);
}

#[tokio::test]
async fn condition_waits_for_complete_controls() {
    let k1 = ControlRef::new("relay", "K1");
    let rules = RuleSet::new().rule(Rule::as_soon_as(
        "relay on",
        move |ctx| ctx.bool_value(&k1) == Some(true),
        |ctx, _| {
            ctx.log().info("relay on");
            Ok(())
        },
    ));
    let (engine, broker, _) = ready_engine(rules).await;

    // value first, the type is still unknown
    engine.deliver(value("relay", "K1", "1")).unwrap();
    engine.sync().await.unwrap();
    broker.verify_empty();

    engine.deliver(control_type("relay", "K1", "switch")).unwrap();
    engine.deliver(value("relay", "K2", "0")).unwrap();
    engine.sync().await.unwrap();
    broker.verify(&["driver -> /wbrules/log/info: [relay on] (QoS 1)"]);

    engine.deliver(value("relay", "K2", "1")).unwrap();
    engine.sync().await.unwrap();
    broker.verify_empty();
}

#[tokio::test]
async fn reload_replaces_rules_and_cancels_timers() {
    let rules = RuleSet::new().on_ready(|ctx| {
        ctx.set_interval(Duration::from_millis(1000), |ctx| {
            ctx.log().info("old rules");
            Ok(())
        })?;
        Ok(())
    });
    let (engine, broker, clock) = ready_engine(rules).await;
    assert_eq!(clock.armed().len(), 1);

    engine
        .reload_rules(RuleSet::new().on_ready(|ctx| {
            ctx.log().info("reloaded");
            Ok(())
        }))
        .unwrap();
    engine.sync().await.unwrap();
    broker.verify(&["driver -> /wbrules/log/info: [reloaded] (QoS 1)"]);
    assert!(clock.armed().is_empty());
    assert!(engine.timers().is_empty());

    let now = clock.advance(Duration::from_millis(1000));
    assert!(clock.request_fire(TimerHandle(1), now).is_err());
}

#[tokio::test]
async fn stop_clears_timers() {
    let rules = RuleSet::new().on_ready(|ctx| {
        ctx.start_ticker("heartbeat", Duration::from_millis(100))?;
        Ok(())
    });
    let (engine, _, clock) = ready_engine(rules).await;
    let timers = engine.timers().clone();
    assert_eq!(timers.len(), 1);

    engine.stop().await;
    assert!(timers.is_empty());
    assert!(clock.armed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn real_clock_fires_timers() {
    let broker = MockBroker::new();
    let engine = Engine::builder(EngineSettings::default(), Arc::new(broker.clone()))
        .rules(RuleSet::new().on_ready(|ctx| {
            ctx.set_timeout(Duration::from_millis(1000), |ctx| {
                ctx.log().info("real timer");
                Ok(())
            })?;
            Ok(())
        }))
        .spawn();
    engine.start().unwrap();
    engine.broker_ready().unwrap();
    engine.ready().wait().await.unwrap();
    engine.sync().await.unwrap();
    broker.take_recorded();

    tokio::time::sleep(Duration::from_millis(999)).await;
    engine.sync().await.unwrap();
    broker.verify_empty();

    tokio::time::sleep(Duration::from_millis(2)).await;
    engine.sync().await.unwrap();
    broker.verify(&["driver -> /wbrules/log/info: [real timer] (QoS 1)"]);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn real_clock_survives_an_endless_timeout() {
    let broker = MockBroker::new();
    let engine = Engine::builder(EngineSettings::default(), Arc::new(broker.clone()))
        .rules(RuleSet::new().on_ready(|ctx| {
            ctx.set_timeout(Duration::MAX, |ctx| {
                ctx.log().info("never");
                Ok(())
            })?;
            ctx.set_timeout(Duration::from_millis(1000), |ctx| {
                ctx.log().info("normal timer");
                Ok(())
            })?;
            Ok(())
        }))
        .spawn();
    engine.start().unwrap();
    engine.broker_ready().unwrap();
    engine.ready().wait().await.unwrap();
    engine.sync().await.unwrap();
    broker.take_recorded();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine.sync().await.unwrap();
    broker.verify(&["driver -> /wbrules/log/info: [normal timer] (QoS 1)"]);
    assert!(engine.timers().is_active(TimerHandle(1)));
    engine.stop().await;
}
