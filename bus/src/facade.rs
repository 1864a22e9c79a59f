//! Consumer facade
//!
//! [`MessageBus`] is the one type external collaborators touch: it builds
//! the bus core and the routing engine, wires them together (the engine
//! keeps only a weak back-reference, so dropping the facade tears both
//! down), and exposes the call-level API. Internal structures never leak;
//! multiple facades are fully independent instances, which is what keeps
//! tests isolated from each other.

use crate::bus::{Bus, SubscribeOptions, SubscriptionHandle};
use crate::clock::{Clock, IdSource, SystemClock, UlidIds};
use crate::config::BusConfig;
use crate::routing::{RouteHandler, RoutingEngine, RoutingStats, TransformFn};
use crate::stats::BusStats;
use std::sync::Arc;
use std::time::Duration;
use vayla_core::{BusError, HandlerError, Message};

/// Builder for [`MessageBus`]
///
/// # Example
///
/// ```
/// use vayla_bus::{BusConfig, MessageBus};
///
/// let bus = MessageBus::builder()
///     .config(BusConfig::default().max_retained(100))
///     .build();
/// assert_eq!(bus.stats().published, 0);
/// ```
pub struct MessageBusBuilder {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl MessageBusBuilder {
    /// Set the configuration
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject a clock (tests pin time with `ManualClock`)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Inject an id source
    pub fn ids(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Build the bus/engine pair
    ///
    /// When called on a tokio runtime this also starts the periodic
    /// bookkeeping sweep; outside a runtime the bus works identically,
    /// minus the background sweep.
    pub fn build(self) -> MessageBus {
        let max_depth = self.config.max_publish_depth;
        let bus = Bus::with_deps(self.config, self.clock, Arc::clone(&self.ids));
        let routing = Arc::new(RoutingEngine::new(
            Arc::downgrade(&bus),
            self.ids,
            max_depth,
        ));
        bus.attach_routing(Arc::clone(&routing));
        let _ = bus.start_cleanup();
        MessageBus { bus, routing }
    }
}

/// The message bus, as seen by collaborators
///
/// Clones share the same instance.
#[derive(Clone)]
pub struct MessageBus {
    bus: Arc<Bus>,
    routing: Arc<RoutingEngine>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MessageBus {
    /// Start building a bus
    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder {
            config: BusConfig::default(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidIds),
        }
    }

    /// Build a bus with defaults
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------

    /// Register a client and its capabilities
    pub fn hello(&self, client_id: &str, capabilities: &[&str]) -> Result<(), BusError> {
        self.bus.hello(client_id, capabilities)
    }

    /// Subscribe a handler to topic patterns
    pub fn subscribe<F>(&self, patterns: &[&str], handler: F) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bus.subscribe(patterns, handler)
    }

    /// Subscribe with retained replay and/or client ownership
    pub fn subscribe_with<F>(
        &self,
        patterns: &[&str],
        options: SubscribeOptions,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bus.subscribe_with(patterns, options, handler)
    }

    /// Remove subscriptions by patterns, optionally scoped to a client
    pub fn unsubscribe(&self, patterns: &[&str], client_id: Option<&str>) {
        self.bus.unsubscribe(patterns, client_id)
    }

    /// Remove the subscriptions behind a handle
    pub fn unsubscribe_handle(&self, handle: SubscriptionHandle) {
        self.bus.unsubscribe_handle(handle)
    }

    /// Tear down a client: subscriptions, rate budget, registration
    pub fn drop_client(&self, client_id: &str) {
        self.bus.drop_client(client_id)
    }

    /// Publish a message; returns its id
    pub fn publish(&self, message: Message) -> Result<String, BusError> {
        self.bus.publish(message)
    }

    /// Publish on behalf of a client
    ///
    /// Stamps the `source` header, which scopes rate limiting and lets
    /// routes match on the publisher.
    pub fn publish_as(&self, client_id: &str, mut message: Message) -> Result<String, BusError> {
        message
            .headers_mut()
            .insert("source".into(), client_id.to_string());
        self.bus.publish(message)
    }

    /// Publish a request and await the correlated reply
    pub async fn request(
        &self,
        topic: &str,
        data: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        self.bus.request(topic, data, timeout).await
    }

    /// Publish the reply to a request message
    pub fn respond(&self, request: &Message, data: serde_json::Value) -> Result<String, BusError> {
        self.bus.respond(request, data)
    }

    /// Clear retained entries matching `pattern`, or all of them
    pub fn clear_retained(&self, pattern: Option<&str>) -> usize {
        self.bus.clear_retained(pattern)
    }

    /// Bus statistics snapshot
    pub fn stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Register a listener for isolated dispatch/routing failures
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        self.bus.on_error(listener)
    }

    // ------------------------------------------------------------------
    // Routing operations
    // ------------------------------------------------------------------

    /// The routing engine: route CRUD, listeners, stats
    pub fn routes(&self) -> &RoutingEngine {
        &self.routing
    }

    /// Register a transform function for `map`/`custom` transforms
    pub fn register_transform(&self, fn_id: impl Into<String>, f: TransformFn) {
        self.routing.register_transform(fn_id, f)
    }

    /// Register a CALL handler
    pub fn register_handler(
        &self,
        handler_id: impl Into<String>,
        handler: Arc<dyn RouteHandler>,
    ) {
        self.routing.register_handler(handler_id, handler)
    }

    /// Register a synchronous closure as a CALL handler
    pub fn register_handler_fn<F>(&self, handler_id: impl Into<String>, f: F)
    where
        F: Fn(Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.routing.register_handler_fn(handler_id, f)
    }

    /// Routing statistics snapshot
    pub fn routing_stats(&self) -> RoutingStats {
        self.routing.stats()
    }
}
