//! Bus core
//!
//! Owns the subscription registry, the retained store, the client table and
//! the rate limiter, and orchestrates the publish pipeline:
//!
//! ```text
//! publish ─► topic check ─► size check ─► rate limit ─► id/ts stamp
//!                 │                                          │
//!                 ▼                                          ▼
//!            MESSAGE_INVALID                      retained store ─► fan-out
//!                                                                      │
//!                                                              routing engine
//! ```
//!
//! Dispatch is synchronous in the caller's stack. No internal lock is ever
//! held while a subscriber runs, so handlers may publish, subscribe, or
//! unsubscribe re-entrantly; the in-flight delivery list is a snapshot and
//! unaffected by such calls.

use crate::clock::{Clock, IdSource, SystemClock, UlidIds};
use crate::config::BusConfig;
use crate::rate_limit::RateLimiter;
use crate::retained::RetainedStore;
use crate::routing::RoutingEngine;
use crate::stats::{BusStats, Counters};
use crate::subscription::{SubscriberFn, SubscriptionRegistry, TokenSet};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use vayla_core::{topic, BusError, HandlerError, Message};

/// Listener invoked for every isolated mid-dispatch failure
pub type ErrorListener = Arc<dyn Fn(&BusError) + Send + Sync>;

/// Options for `subscribe_with`
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Replay matching retained messages synchronously before returning
    pub retained: bool,
    /// Client the subscriptions belong to (scopes `unsubscribe`/teardown)
    pub client_id: Option<String>,
}

/// Opaque handle identifying the subscriptions made by one `subscribe` call
///
/// Dropping the handle does *not* unsubscribe; pass it back to
/// [`Bus::unsubscribe_handle`]. Subscriptions never expire silently.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub(crate) tokens: TokenSet,
}

struct ClientInfo {
    capabilities: HashSet<String>,
}

/// The bus core
///
/// Construct through [`crate::MessageBus`] unless you are wiring a custom
/// routing engine; the facade owns the bus/engine pairing.
pub struct Bus {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    subscriptions: RwLock<SubscriptionRegistry>,
    retained: Mutex<RetainedStore>,
    clients: RwLock<HashMap<String, ClientInfo>>,
    limiter: RateLimiter,
    counters: Counters,
    error_listeners: RwLock<Vec<ErrorListener>>,
    routing: RwLock<Option<Arc<RoutingEngine>>>,
}

impl Bus {
    /// Create a bus with the default clock and id source
    pub fn new(config: BusConfig) -> Arc<Self> {
        Self::with_deps(config, Arc::new(SystemClock), Arc::new(UlidIds))
    }

    /// Create a bus with injected time and id sources
    pub fn with_deps(
        config: BusConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Arc<Self> {
        let limiter = RateLimiter::new(config.rate_limit_per_client);
        let retained = RetainedStore::new(config.max_retained);
        Arc::new(Self {
            config,
            clock,
            ids,
            subscriptions: RwLock::new(SubscriptionRegistry::new()),
            retained: Mutex::new(retained),
            clients: RwLock::new(HashMap::new()),
            limiter,
            counters: Counters::default(),
            error_listeners: RwLock::new(Vec::new()),
            routing: RwLock::new(None),
        })
    }

    /// Bus configuration
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Attach the routing engine evaluated after each publish
    pub(crate) fn attach_routing(&self, engine: Arc<RoutingEngine>) {
        *self.routing.write() = Some(engine);
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Register a client
    ///
    /// Clients scope rate limiting and subscription ownership; nothing is
    /// validated beyond a non-empty id, and re-registering replaces the
    /// capability set.
    pub fn hello(
        &self,
        client_id: &str,
        capabilities: &[&str],
    ) -> Result<(), BusError> {
        if client_id.is_empty() {
            return Err(BusError::InvalidMessage("client id must not be empty".into()));
        }
        let caps: HashSet<String> = capabilities.iter().map(|s| s.to_string()).collect();
        info!(client = client_id, capabilities = capabilities.len(), "client hello");
        self.clients
            .write()
            .insert(client_id.to_string(), ClientInfo { capabilities: caps });
        Ok(())
    }

    /// Whether `client_id` registered `capability` in its `hello`
    pub fn client_has_capability(&self, client_id: &str, capability: &str) -> bool {
        self.clients
            .read()
            .get(client_id)
            .is_some_and(|c| c.capabilities.contains(capability))
    }

    /// Tear down a client: its subscriptions, rate budget, and registration
    pub fn drop_client(&self, client_id: &str) {
        let removed = self.subscriptions.write().remove_client(client_id);
        self.limiter.forget(client_id);
        self.clients.write().remove(client_id);
        info!(client = client_id, subscriptions = removed, "client dropped");
    }

    // ------------------------------------------------------------------
    // Subscribe / unsubscribe
    // ------------------------------------------------------------------

    /// Subscribe a handler to one or more topic patterns
    pub fn subscribe<F>(&self, patterns: &[&str], handler: F) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_with(patterns, SubscribeOptions::default(), handler)
    }

    /// Subscribe with options (retained replay, client ownership)
    ///
    /// With `options.retained`, every retained message matching any of the
    /// given patterns is delivered synchronously - in store recency order,
    /// each entry at most once - before this call returns.
    pub fn subscribe_with<F>(
        &self,
        patterns: &[&str],
        options: SubscribeOptions,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        for pattern in patterns {
            if *pattern == "*" && !self.config.allow_global_wildcard {
                return Err(BusError::WildcardDisabled);
            }
            if !topic::is_valid_pattern(pattern) {
                return Err(BusError::InvalidMessage(format!(
                    "invalid subscription pattern '{pattern}'"
                )));
            }
        }

        let handler: Arc<SubscriberFn> = Arc::new(handler);
        let mut tokens = TokenSet::new();
        {
            let mut registry = self.subscriptions.write();
            for pattern in patterns {
                tokens.push(registry.add(*pattern, options.client_id.clone(), Arc::clone(&handler)));
            }
        }
        debug!(patterns = ?patterns, client = ?options.client_id, "subscribed");

        if options.retained {
            let replay = self.retained.lock().all_matching_any(patterns);
            for msg in &replay {
                self.invoke(&handler, "retained replay", msg);
            }
        }

        Ok(SubscriptionHandle { tokens })
    }

    /// Remove subscriptions by pattern set, optionally scoped to a client
    ///
    /// Idempotent: unknown patterns and already-removed subscriptions are
    /// no-ops.
    pub fn unsubscribe(&self, patterns: &[&str], client_id: Option<&str>) {
        let removed = self.subscriptions.write().remove_matching(patterns, client_id);
        debug!(patterns = ?patterns, client = ?client_id, removed, "unsubscribed");
    }

    /// Remove the subscriptions behind a handle; idempotent
    pub fn unsubscribe_handle(&self, handle: SubscriptionHandle) {
        self.subscriptions.write().remove_tokens(&handle.tokens);
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    /// Publish a message to all matching subscribers and routes
    ///
    /// Returns the message id (assigned here when the caller left it out).
    /// The client charged for rate limiting is the `source` header when
    /// present, the shared anonymous budget otherwise.
    pub fn publish(&self, message: Message) -> Result<String, BusError> {
        self.publish_inner(message, true)
    }

    /// Publish bypassing the rate limiter - internal path for route actions
    pub(crate) fn publish_routed(&self, message: Message) -> Result<String, BusError> {
        self.publish_inner(message, false)
    }

    fn publish_inner(&self, mut message: Message, enforce_limit: bool) -> Result<String, BusError> {
        if !topic::is_valid_topic(&message.topic) {
            return Err(BusError::InvalidMessage(format!(
                "invalid topic '{}'",
                message.topic
            )));
        }

        let payload_size = message.payload_size();
        if payload_size > self.config.max_payload_size {
            return Err(BusError::PayloadTooLarge {
                size: payload_size,
                max: self.config.max_payload_size,
            });
        }
        let envelope_size = message.envelope_size();
        if envelope_size > self.config.max_message_size {
            return Err(BusError::MessageTooLarge {
                size: envelope_size,
                max: self.config.max_message_size,
            });
        }

        if enforce_limit {
            let client = message.source().unwrap_or("anonymous").to_string();
            if !self.limiter.try_acquire(&client) {
                Counters::incr(&self.counters.dropped_rate_limited);
                warn!(client = %client, topic = %message.topic, "publish rate limited");
                return Err(BusError::RateLimitExceeded { client });
            }
        }

        if message.id.is_none() {
            message.id = Some(self.ids.next_id());
        }
        if message.ts.is_none() {
            message.ts = Some(self.clock.now_ms());
        }
        // validated topics are never empty, ids were just assigned
        let id = message.id.clone().unwrap_or_default();

        Counters::incr(&self.counters.published);

        if message.retain {
            self.retained.lock().put(message.clone());
        }

        let deliveries = self.subscriptions.read().find(&message.topic);
        debug!(topic = %message.topic, subscribers = deliveries.len(), "dispatching");
        for delivery in &deliveries {
            self.invoke(&delivery.handler, &delivery.pattern, &message);
        }

        let engine = self.routing.read().clone();
        if let Some(engine) = engine {
            engine.evaluate(&message);
        }

        Ok(id)
    }

    /// Invoke one handler with per-handler error isolation
    fn invoke(&self, handler: &Arc<SubscriberFn>, pattern: &str, message: &Message) {
        match handler(message) {
            Ok(()) => Counters::incr(&self.counters.delivered),
            Err(cause) => {
                Counters::incr(&self.counters.handler_errors);
                let err = BusError::SubscriptionHandler {
                    pattern: pattern.to_string(),
                    topic: message.topic.clone(),
                    cause: cause.to_string(),
                };
                warn!(pattern, topic = %message.topic, %cause, "subscriber failed");
                self.report(&err);
            }
        }
    }

    // ------------------------------------------------------------------
    // Request / reply
    // ------------------------------------------------------------------

    /// Publish a request and await the correlated reply
    ///
    /// An ephemeral reply subscription is created for the exchange and torn
    /// down on the first matching reply and on timeout alike - no handles
    /// leak. Replies arriving after resolution are ignored (nobody is
    /// subscribed any more). Timeout defaults to the configured
    /// `request_timeout_ms`.
    pub async fn request(
        &self,
        topic: &str,
        data: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(self.config.request_timeout_ms));
        let correlation_id = self.ids.next_id();
        let reply_topic = format!("vayla.reply.{correlation_id}");

        let (tx, rx) = tokio::sync::oneshot::channel::<Message>();
        let slot = Mutex::new(Some(tx));
        let expected = correlation_id.clone();
        let handle = self.subscribe(&[reply_topic.as_str()], move |msg: &Message| {
            if msg.correlation_id.as_deref() == Some(expected.as_str()) {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(msg.clone());
                }
            }
            Ok(())
        })?;

        let request =
            Message::new(topic, data).with_reply(reply_topic.clone(), correlation_id.clone());
        if let Err(err) = self.publish(request) {
            self.unsubscribe_handle(handle);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                self.unsubscribe_handle(handle);
                Ok(reply)
            }
            // channel closed or timer fired: either way nothing will arrive
            Ok(Err(_)) | Err(_) => {
                self.unsubscribe_handle(handle);
                debug!(topic, correlation_id = %correlation_id, "request timed out");
                Err(BusError::RequestTimeout {
                    topic: topic.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Publish the reply to a request message
    ///
    /// Builds the envelope from the request's `reply_to`/`correlation_id`.
    pub fn respond(&self, request: &Message, data: serde_json::Value) -> Result<String, BusError> {
        let reply_to = request.reply_to.as_deref().ok_or_else(|| {
            BusError::InvalidMessage("message has no reply_to to respond on".into())
        })?;
        let correlation_id = request.correlation_id.clone().ok_or_else(|| {
            BusError::InvalidMessage("message has no correlation_id to respond with".into())
        })?;
        let mut reply = Message::new(reply_to, data);
        reply.correlation_id = Some(correlation_id);
        self.publish(reply)
    }

    // ------------------------------------------------------------------
    // Retained / stats / errors
    // ------------------------------------------------------------------

    /// Clear retained entries matching `pattern`, or all of them
    ///
    /// Returns the number of entries removed.
    pub fn clear_retained(&self, pattern: Option<&str>) -> usize {
        self.retained.lock().clear_matching(pattern)
    }

    /// Point-in-time statistics; read-only
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: Counters::get(&self.counters.published),
            delivered: Counters::get(&self.counters.delivered),
            dropped: Counters::get(&self.counters.dropped_rate_limited),
            handler_errors: Counters::get(&self.counters.handler_errors),
            retained: self.retained.lock().len(),
            subscriptions: self.subscriptions.read().len(),
            clients: self.clients.read().len(),
        }
    }

    /// Register a listener for isolated mid-dispatch failures
    ///
    /// Listeners observe handler, predicate, transform, and action errors;
    /// they are never invoked while internal locks are held.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        self.error_listeners.write().push(Arc::new(listener));
    }

    /// Fan an isolated error out to the registered listeners
    pub(crate) fn report(&self, err: &BusError) {
        let listeners: Vec<ErrorListener> = self.error_listeners.read().clone();
        for listener in listeners {
            listener(err);
        }
    }

    // ------------------------------------------------------------------
    // Cleanup sweep
    // ------------------------------------------------------------------

    /// Spawn the periodic bookkeeping sweep on the current tokio runtime
    ///
    /// Frees rate budgets of clients idle for two sweep intervals. Holds
    /// only a weak reference: the task ends when the bus is dropped. No-op
    /// outside a runtime (there is nothing to sweep eagerly; all cleanup is
    /// bookkeeping only).
    pub fn start_cleanup(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = Duration::from_millis(self.config.cleanup_interval_ms.max(1));
        let idle_nanos = interval.as_nanos().saturating_mul(2) as u64;
        let weak: Weak<Bus> = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::try_current().ok()?;
        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(bus) = weak.upgrade() else { break };
                bus.limiter.sweep(idle_nanos);
            }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_bus() -> Arc<Bus> {
        Bus::new(BusConfig::default())
    }

    fn counting_handler() -> (Arc<AtomicUsize>, impl Fn(&Message) -> Result<(), HandlerError>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_msg: &Message| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn publish_reaches_matching_subscriber_once() {
        let bus = test_bus();
        let (count, handler) = counting_handler();
        bus.subscribe(&["user.*"], handler).unwrap();

        bus.publish(Message::new("user.login", json!({"id": 1}))).unwrap();
        bus.publish(Message::new("cart.total", json!(1))).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_assigns_id_and_ts() {
        let clock = ManualClock::new(42_000);
        let bus = Bus::with_deps(BusConfig::default(), clock, Arc::new(UlidIds));
        let seen = Arc::new(Mutex::new(Vec::<Message>::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(&["t"], move |msg: &Message| {
            sink.lock().push(msg.clone());
            Ok(())
        })
        .unwrap();

        let id = bus.publish(Message::new("t", json!(null))).unwrap();
        let delivered = seen.lock();
        assert_eq!(delivered[0].id.as_deref(), Some(id.as_str()));
        assert_eq!(delivered[0].ts, Some(42_000));
    }

    #[test]
    fn caller_supplied_id_and_ts_are_kept() {
        let bus = test_bus();
        let mut msg = Message::new("t", json!(null));
        msg.id = Some("custom-1".into());
        msg.ts = Some(7);
        let id = bus.publish(msg).unwrap();
        assert_eq!(id, "custom-1");
    }

    #[test]
    fn invalid_topics_are_rejected() {
        let bus = test_bus();
        for topic in ["", "a b", "a..b", ".a", "a.", "a/b", "a.*"] {
            let err = bus.publish(Message::new(topic, json!(null))).unwrap_err();
            assert_eq!(err.code(), "MESSAGE_INVALID", "topic {topic:?}");
        }
    }

    #[test]
    fn oversized_payload_and_envelope_are_rejected() {
        let config = BusConfig::default()
            .max_payload_size(64)
            .max_message_size(128);
        let bus = Bus::new(config);

        let err = bus
            .publish(Message::new("t", json!("x".repeat(100))))
            .unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_TOO_LARGE");

        // payload fits, envelope (headers) pushes the total over
        let mut msg = Message::new("t", json!("ok"));
        for i in 0..10 {
            msg = msg.with_header(format!("header_{i}"), "long-ish header value");
        }
        let err = bus.publish(msg).unwrap_err();
        assert_eq!(err.code(), "MESSAGE_TOO_LARGE");
    }

    #[test]
    fn rate_limited_publish_is_dropped_before_delivery() {
        let config = BusConfig::default().rate_limit_per_client(2);
        let bus = Bus::new(config);
        let (count, handler) = counting_handler();
        bus.subscribe(&["t"], handler).unwrap();

        let publish = |bus: &Bus| {
            bus.publish(Message::new("t", json!(null)).with_header("source", "spammer"))
        };
        publish(&bus).unwrap();
        publish(&bus).unwrap();
        let err = publish(&bus).unwrap_err();

        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().dropped, 1);
    }

    #[test]
    fn handler_error_is_isolated_and_reported() {
        let bus = test_bus();
        let reported = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&reported);
        bus.on_error(move |err| sink.lock().push(err.code().to_string()));

        bus.subscribe(&["t"], |_msg: &Message| Err(HandlerError::new("boom")))
            .unwrap();
        let (count, handler) = counting_handler();
        bus.subscribe(&["t"], handler).unwrap();

        bus.publish(Message::new("t", json!(null))).unwrap();

        // the failing handler did not stop the second one
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(reported.lock().as_slice(), ["SUBSCRIPTION_HANDLER_ERROR"]);
        assert_eq!(bus.stats().handler_errors, 1);
    }

    #[test]
    fn delivery_order_is_subscription_order() {
        let bus = test_bus();
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        for (name, pattern) in [("wild", "user.*"), ("exact", "user.login"), ("global", "*")] {
            let sink = Arc::clone(&order);
            bus.subscribe(&[pattern], move |_msg: &Message| {
                sink.lock().push(name);
                Ok(())
            })
            .unwrap();
        }

        bus.publish(Message::new("user.login", json!(null))).unwrap();
        assert_eq!(order.lock().as_slice(), ["wild", "exact", "global"]);
    }

    #[test]
    fn retained_replay_on_subscribe() {
        let bus = test_bus();
        bus.publish(Message::new("cart.total", json!(100)).with_retain())
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::<Message>::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_with(
            &["cart.total"],
            SubscribeOptions { retained: true, ..Default::default() },
            move |msg: &Message| {
                sink.lock().push(msg.clone());
                Ok(())
            },
        )
        .unwrap();

        // delivered synchronously during subscribe, no further publish
        let delivered = seen.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data, json!(100));
    }

    #[test]
    fn retained_replay_dedups_across_patterns() {
        let bus = test_bus();
        bus.publish(Message::new("a.b", json!(1)).with_retain()).unwrap();

        let (count, handler) = counting_handler();
        // both patterns match the same retained entry
        bus.subscribe_with(
            &["a.b", "a.*"],
            SubscribeOptions { retained: true, ..Default::default() },
            handler,
        )
        .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_without_retained_does_not_replay() {
        let bus = test_bus();
        bus.publish(Message::new("a.b", json!(1)).with_retain()).unwrap();
        let (count, handler) = counting_handler();
        bus.subscribe(&["a.b"], handler).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn global_wildcard_can_be_disabled() {
        let bus = Bus::new(BusConfig::default().allow_global_wildcard(false));
        let err = bus.subscribe(&["*"], |_msg: &Message| Ok(())).unwrap_err();
        assert_eq!(err.code(), "WILDCARD_DISABLED");
        // per-segment wildcards stay allowed
        bus.subscribe(&["user.*"], |_msg: &Message| Ok(())).unwrap();
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let bus = test_bus();
        let err = bus.subscribe(&["user.**"], |_msg: &Message| Ok(())).unwrap_err();
        assert_eq!(err.code(), "MESSAGE_INVALID");
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = test_bus();
        let (count, handler) = counting_handler();
        bus.subscribe_with(
            &["t"],
            SubscribeOptions { client_id: Some("ui".into()), ..Default::default() },
            handler,
        )
        .unwrap();

        bus.unsubscribe(&["t"], Some("ui"));
        bus.unsubscribe(&["t"], Some("ui"));
        bus.unsubscribe(&["never.subscribed"], None);

        bus.publish(Message::new("t", json!(null))).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_unsubscribing_mid_dispatch_does_not_affect_inflight_delivery() {
        let bus = Bus::new(BusConfig::default());
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let bus2 = Arc::clone(&bus);
        let sink = Arc::clone(&order);
        bus.subscribe(&["t"], move |_msg: &Message| {
            sink.lock().push("first");
            // removes the *second* subscriber for future dispatches only
            bus2.unsubscribe(&["t"], Some("victim"));
            Ok(())
        })
        .unwrap();

        let sink = Arc::clone(&order);
        bus.subscribe_with(
            &["t"],
            SubscribeOptions { client_id: Some("victim".into()), ..Default::default() },
            move |_msg: &Message| {
                sink.lock().push("second");
                Ok(())
            },
        )
        .unwrap();

        bus.publish(Message::new("t", json!(null))).unwrap();
        assert_eq!(order.lock().as_slice(), ["first", "second"]);

        bus.publish(Message::new("t", json!(null))).unwrap();
        assert_eq!(order.lock().as_slice(), ["first", "second", "first"]);
    }

    #[test]
    fn reentrant_publish_is_depth_first() {
        let bus = Bus::new(BusConfig::default());
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        let bus2 = Arc::clone(&bus);
        let sink = Arc::clone(&order);
        bus.subscribe(&["outer"], move |_msg: &Message| {
            sink.lock().push("outer:start".into());
            bus2.publish(Message::new("inner", json!(null)))
                .map_err(HandlerError::new)?;
            sink.lock().push("outer:end".into());
            Ok(())
        })
        .unwrap();

        let sink = Arc::clone(&order);
        bus.subscribe(&["inner"], move |_msg: &Message| {
            sink.lock().push("inner".into());
            Ok(())
        })
        .unwrap();

        bus.publish(Message::new("outer", json!(null))).unwrap();
        assert_eq!(
            order.lock().as_slice(),
            ["outer:start", "inner", "outer:end"]
        );
    }

    #[test]
    fn hello_requires_nonempty_id() {
        let bus = test_bus();
        assert_eq!(
            bus.hello("", &[]).unwrap_err().code(),
            "MESSAGE_INVALID"
        );
        bus.hello("ui", &["render", "routes"]).unwrap();
        assert!(bus.client_has_capability("ui", "render"));
        assert!(!bus.client_has_capability("ui", "persist"));
        assert_eq!(bus.stats().clients, 1);
    }

    #[test]
    fn drop_client_tears_down_subscriptions() {
        let bus = test_bus();
        bus.hello("ui", &[]).unwrap();
        let (count, handler) = counting_handler();
        bus.subscribe_with(
            &["a.*", "b.*"],
            SubscribeOptions { client_id: Some("ui".into()), ..Default::default() },
            handler,
        )
        .unwrap();
        assert_eq!(bus.stats().subscriptions, 2);

        bus.drop_client("ui");
        assert_eq!(bus.stats().subscriptions, 0);
        assert_eq!(bus.stats().clients, 0);

        bus.publish(Message::new("a.x", json!(null))).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_retained_scopes_to_pattern() {
        let bus = test_bus();
        bus.publish(Message::new("a.x", json!(1)).with_retain()).unwrap();
        bus.publish(Message::new("b.y", json!(2)).with_retain()).unwrap();

        assert_eq!(bus.clear_retained(Some("a.*")), 1);
        assert_eq!(bus.stats().retained, 1);
        assert_eq!(bus.clear_retained(None), 1);
        assert_eq!(bus.stats().retained, 0);
    }

    #[test]
    fn stats_count_published_and_delivered() {
        let bus = test_bus();
        let (_count, handler) = counting_handler();
        bus.subscribe(&["*"], handler).unwrap();
        let (_count2, handler2) = counting_handler();
        bus.subscribe(&["t"], handler2).unwrap();

        bus.publish(Message::new("t", json!(null))).unwrap();
        bus.publish(Message::new("u", json!(null))).unwrap();

        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.subscriptions, 2);
    }

    #[tokio::test]
    async fn request_resolves_with_correlated_reply() {
        let bus = Bus::new(BusConfig::default());

        let responder = Arc::clone(&bus);
        bus.subscribe(&["math.double"], move |msg: &Message| {
            let n = msg.data.as_i64().unwrap_or(0);
            responder
                .respond(msg, json!(n * 2))
                .map_err(HandlerError::new)?;
            Ok(())
        })
        .unwrap();

        let reply = bus
            .request("math.double", json!(21), Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(reply.data, json!(42));
        // ephemeral reply subscription is gone
        assert_eq!(bus.stats().subscriptions, 1);
    }

    #[tokio::test]
    async fn request_times_out_and_leaks_nothing() {
        let bus = Bus::new(BusConfig::default());
        let err = bus
            .request("nobody.home", json!(null), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REQUEST_TIMEOUT");
        assert_eq!(bus.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn late_second_reply_is_ignored() {
        let bus = Bus::new(BusConfig::default());

        let responder = Arc::clone(&bus);
        bus.subscribe(&["echo"], move |msg: &Message| {
            // two replies; only the first may win
            responder.respond(msg, json!("first")).map_err(HandlerError::new)?;
            responder.respond(msg, json!("second")).map_err(HandlerError::new)?;
            Ok(())
        })
        .unwrap();

        let reply = bus
            .request("echo", json!(null), Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(reply.data, json!("first"));
    }

    #[tokio::test]
    async fn cleanup_sweep_runs_and_stops_with_the_bus() {
        let bus = Bus::new(BusConfig::default().cleanup_interval_ms(5));
        let task = bus.start_cleanup().unwrap();
        bus.publish(Message::new("t", json!(null)).with_header("source", "c1"))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(bus);
        // the weak upgrade fails on the next tick and the task exits
        tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .unwrap()
            .unwrap();
    }
}
