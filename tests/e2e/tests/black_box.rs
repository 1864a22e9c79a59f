//! Black-box E2E scenarios
//!
//! Exercises the bus exactly as an external module host would: through the
//! `MessageBus` facade, with no knowledge of internals. Covers the core
//! guarantees - wildcard delivery, retained replay, LRU eviction at
//! capacity, per-client rate limiting, request/reply correlation, and
//! routing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::time::Duration;
use vayla_bus::{ActionSpec, BusConfig, MatchSpec, MessageBus, OneOrMany, Predicate, RouteSpec};
use vayla_core::Message;
use vayla_e2e::{error_codes, CaptureSubscriber};

/// Scenario 1: wildcard subscription receives exactly one matching publish
#[test]
fn wildcard_subscriber_receives_matching_publish() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let bus = MessageBus::new();
    let sub = CaptureSubscriber::new();
    sub.attach(&bus, &["user.*"]);

    bus.publish(Message::new("user.login", json!({"id": 1}))).unwrap();

    let messages = sub.take_all();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "user.login");
    assert_eq!(messages[0].data, json!({"id": 1}));
    assert!(messages[0].id.is_some());
    assert!(messages[0].ts.is_some());
}

/// Scenario 2: retained value replayed synchronously during subscribe
#[test]
fn late_subscriber_recovers_retained_state() {
    let bus = MessageBus::new();
    bus.publish(Message::new("cart.total", json!(100)).with_retain()).unwrap();

    let sub = CaptureSubscriber::new();
    sub.attach_retained(&bus, &["cart.total"]);

    // delivered during the subscribe call itself - no publish in between
    let messages = sub.take_all();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, json!(100));
    assert!(messages[0].retain);
}

/// Scenario 3: threshold route emits on alert topic only when matched
#[test]
fn threshold_route_emits_alert() {
    let bus = MessageBus::new();
    let alerts = CaptureSubscriber::new();
    alerts.attach(&bus, &["alert.highTemp"]);

    bus.routes()
        .add(
            RouteSpec::new("high-temp")
                .match_spec(MatchSpec {
                    topic: Some(OneOrMany::One("sensor.temp".into())),
                    where_clause: Some(Predicate::Gt {
                        path: "data.value".into(),
                        value: json!(30),
                    }),
                    ..Default::default()
                })
                .action(ActionSpec::Emit {
                    message: json!({"topic": "alert.highTemp"}),
                    inherit: vec!["data".into()],
                }),
        )
        .unwrap();

    bus.publish(Message::new("sensor.temp", json!({"value": 35}))).unwrap();
    assert_eq!(alerts.count(), 1);

    bus.publish(Message::new("sensor.temp", json!({"value": 20}))).unwrap();
    assert_eq!(alerts.count(), 1);
}

/// Scenario 4: 1001 retained topics leave 1000 resident, oldest evicted
#[test]
fn retained_store_evicts_oldest_at_capacity() {
    let bus = MessageBus::builder()
        .config(BusConfig::default().rate_limit_per_client(0))
        .build();

    for i in 1..=1001 {
        bus.publish(Message::new(format!("state.t{i}"), json!(i)).with_retain())
            .unwrap();
    }
    assert_eq!(bus.stats().retained, 1000);

    // T1 is gone, T2 and T1001 are still replayable
    let t1 = CaptureSubscriber::new();
    t1.attach_retained(&bus, &["state.t1"]);
    assert_eq!(t1.count(), 0);

    let survivors = CaptureSubscriber::new();
    survivors.attach_retained(&bus, &["state.t2", "state.t1001"]);
    assert_eq!(survivors.count(), 2);
}

/// Excess publishes over the per-client budget are rejected, not delivered
#[test]
fn rate_limited_client_messages_never_reach_subscribers() {
    let bus = MessageBus::builder()
        .config(BusConfig::default().rate_limit_per_client(5))
        .build();
    let sub = CaptureSubscriber::new();
    sub.attach(&bus, &["burst.*"]);

    let mut rejected = 0;
    for i in 0..20 {
        match bus.publish_as("chatty", Message::new("burst.msg", json!(i))) {
            Ok(_) => {}
            Err(err) => {
                assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
                rejected += 1;
            }
        }
    }

    assert!(rejected >= 14, "only {rejected} rejections");
    assert_eq!(sub.count() as u64, 20 - rejected);
    assert_eq!(bus.stats().dropped, rejected);

    // a different client still has budget
    bus.publish_as("quiet", Message::new("burst.other", json!(0))).unwrap();
    assert_eq!(sub.count() as u64, 20 - rejected + 1);
}

/// Request/reply resolves on correlation, times out cleanly, leaks nothing
#[tokio::test]
async fn request_reply_round_trip_and_timeout() {
    let bus = MessageBus::new();

    let responder = bus.clone();
    bus.subscribe(&["config.get"], move |msg: &Message| {
        responder
            .respond(msg, json!({"theme": "dark"}))
            .map_err(vayla_core::HandlerError::new)?;
        Ok(())
    })
    .unwrap();

    let reply = bus
        .request("config.get", json!({"key": "theme"}), Some(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(reply.data, json!({"theme": "dark"}));
    assert!(reply.correlation_id.is_some());

    // unanswered request times out and the reply subscription is gone
    let before = bus.stats().subscriptions;
    let err = bus
        .request("config.missing", json!(null), Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "REQUEST_TIMEOUT");
    assert_eq!(bus.stats().subscriptions, before);
}

/// Two routes on the same message execute in `order`, not insertion, order
#[test]
fn route_order_is_deterministic() {
    let bus = MessageBus::new();
    let sub = CaptureSubscriber::new();
    sub.attach(&bus, &["step.*"]);

    // added in reverse order on purpose
    bus.routes()
        .add(
            RouteSpec::new("second")
                .order(20)
                .match_spec(MatchSpec {
                    topic: Some(OneOrMany::One("go".into())),
                    ..Default::default()
                })
                .action(ActionSpec::Emit { message: json!({"topic": "step.two"}), inherit: vec![] }),
        )
        .unwrap();
    bus.routes()
        .add(
            RouteSpec::new("first")
                .order(10)
                .match_spec(MatchSpec {
                    topic: Some(OneOrMany::One("go".into())),
                    ..Default::default()
                })
                .action(ActionSpec::Emit { message: json!({"topic": "step.one"}), inherit: vec![] }),
        )
        .unwrap();

    bus.publish(Message::new("go", json!(null))).unwrap();
    assert_eq!(sub.topics(), vec!["step.one", "step.two"]);
}

/// Unsubscribing twice is a no-op the second time
#[test]
fn double_unsubscribe_is_harmless() {
    let bus = MessageBus::new();
    let sub = CaptureSubscriber::new();
    sub.attach(&bus, &["t"]);

    bus.unsubscribe(&["t"], None);
    bus.unsubscribe(&["t"], None);

    bus.publish(Message::new("t", json!(null))).unwrap();
    assert_eq!(sub.count(), 0);
    assert_eq!(bus.stats().subscriptions, 0);
}

/// Subscriber failures are isolated and visible through stats + listeners
#[test]
fn failing_subscriber_does_not_break_the_bus() {
    let bus = MessageBus::new();
    let codes = error_codes(&bus);

    bus.subscribe(&["evt"], |_msg: &Message| {
        Err(vayla_core::HandlerError::new("always broken"))
    })
    .unwrap();
    let healthy = CaptureSubscriber::new();
    healthy.attach(&bus, &["evt"]);

    for _ in 0..3 {
        bus.publish(Message::new("evt", json!(null))).unwrap();
    }

    assert_eq!(healthy.count(), 3);
    assert_eq!(bus.stats().handler_errors, 3);
    assert_eq!(codes.lock().len(), 3);
}

/// A full module conversation: hello, capability, publish, teardown
#[test]
fn client_lifecycle_end_to_end() {
    let bus = MessageBus::new();
    bus.hello("settings-module", &["settings.read", "settings.write"]).unwrap();

    bus.subscribe_with(
        &["settings.*"],
        vayla_bus::SubscribeOptions {
            client_id: Some("settings-module".into()),
            ..Default::default()
        },
        |_msg: &Message| Ok(()),
    )
    .unwrap();
    let sub2 = CaptureSubscriber::new();
    sub2.attach(&bus, &["settings.changed"]);

    bus.publish_as("settings-module", Message::new("settings.changed", json!({"k": "v"})))
        .unwrap();
    assert_eq!(sub2.count(), 1);
    assert_eq!(sub2.take_all()[0].source(), Some("settings-module"));

    bus.drop_client("settings-module");
    assert_eq!(bus.stats().clients, 0);
    assert_eq!(bus.stats().subscriptions, 1); // only the anonymous capture remains
}
