//! Routing engine
//!
//! Owns the route table and the transform/handler registration tables,
//! evaluates every published message against the enabled routes, and runs
//! matched routes' actions. The engine holds only a weak reference to the
//! bus: EMIT/FORWARD actions re-enter `publish` through it, recursing
//! synchronously and depth-first, and dropping the bus tears the pair down
//! without a reference cycle.
//!
//! # Isolation
//!
//! A failing predicate skips its route; a failing transform skips its
//! route's actions; a failing action skips nothing else. Every failure is
//! counted, traced, and fanned out to the error listeners. One poisoned
//! route cannot take down the others.

use super::action;
use super::predicate;
use super::spec::{ActionSpec, MatchSpec, Route, RoutePatch, RouteSpec};
use super::transform::{TransformFailure, TransformFn, TransformRegistry};
use crate::bus::{Bus, ErrorListener};
use crate::clock::IdSource;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use vayla_core::{BusError, HandlerError, Message};

thread_local! {
    /// Nested evaluation depth on this call stack (EMIT/FORWARD recursion)
    static EVAL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Handler invoked by CALL actions
///
/// May be asynchronous: on a tokio runtime the engine fires the call and
/// moves on without awaiting it; failures surface through the error
/// listeners when the call eventually resolves.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Handle a routed message
    async fn call(&self, message: Message) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> RouteHandler for FnHandler<F>
where
    F: Fn(Message) -> Result<(), HandlerError> + Send + Sync,
{
    async fn call(&self, message: Message) -> Result<(), HandlerError> {
        (self.0)(message)
    }
}

/// Route-table change event delivered to `on_change` listeners
#[derive(Debug, Clone)]
pub enum RouteChange {
    /// A route was added
    Added(Route),
    /// A route definition was updated
    Updated(Route),
    /// A route was removed (by id)
    Removed(String),
    /// A route was enabled (by id)
    Enabled(String),
    /// A route was disabled (by id)
    Disabled(String),
    /// All routes were removed
    Cleared,
}

/// Filter for `list`
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    /// Keep only routes with this enabled state
    pub enabled: Option<bool>,
    /// Keep only routes whose name starts with this prefix
    pub name_prefix: Option<String>,
}

/// Monotonic engine statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStats {
    /// Route evaluations (once per enabled route per message)
    pub routes_evaluated: u64,
    /// Evaluations whose match section held
    pub routes_matched: u64,
    /// Actions that began executing
    pub actions_executed: u64,
    /// Isolated predicate/transform/action failures
    pub errors: u64,
}

#[derive(Default)]
struct EngineCounters {
    evaluated: AtomicU64,
    matched: AtomicU64,
    actions: AtomicU64,
    errors: AtomicU64,
}

struct RouteEntry {
    id: String,
    seq: u64,
    spec: RwLock<RouteSpec>,
    evaluated: AtomicU64,
    matched: AtomicU64,
}

impl RouteEntry {
    fn snapshot(&self) -> Route {
        Route {
            id: self.id.clone(),
            spec: self.spec.read().clone(),
            evaluated: self.evaluated.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
        }
    }
}

type ChangeListener = Arc<dyn Fn(&RouteChange) + Send + Sync>;

/// The routing engine; constructed and wired by the facade
pub struct RoutingEngine {
    bus: Weak<Bus>,
    ids: Arc<dyn IdSource>,
    max_depth: usize,
    enabled: AtomicBool,
    routes: RwLock<Vec<Arc<RouteEntry>>>,
    next_seq: AtomicU64,
    transforms: TransformRegistry,
    handlers: RwLock<HashMap<String, Arc<dyn RouteHandler>>>,
    counters: EngineCounters,
    change_listeners: RwLock<Vec<ChangeListener>>,
    error_listeners: RwLock<Vec<ErrorListener>>,
}

impl RoutingEngine {
    pub(crate) fn new(bus: Weak<Bus>, ids: Arc<dyn IdSource>, max_depth: usize) -> Self {
        Self {
            bus,
            ids,
            max_depth,
            enabled: AtomicBool::new(true),
            routes: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            transforms: TransformRegistry::default(),
            handlers: RwLock::new(HashMap::new()),
            counters: EngineCounters::default(),
            change_listeners: RwLock::new(Vec::new()),
            error_listeners: RwLock::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Add a route; validates structure and returns the stored route
    pub fn add(&self, spec: RouteSpec) -> Result<Route, BusError> {
        spec.validate()?;
        let entry = Arc::new(RouteEntry {
            id: self.ids.next_id(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            spec: RwLock::new(spec),
            evaluated: AtomicU64::new(0),
            matched: AtomicU64::new(0),
        });
        let snapshot = entry.snapshot();
        {
            let mut routes = self.routes.write();
            routes.push(entry);
            Self::sort(&mut routes);
        }
        info!(route = %snapshot.spec.name, id = %snapshot.id, "route added");
        self.notify(&RouteChange::Added(snapshot.clone()));
        Ok(snapshot)
    }

    /// Apply a partial update; id, insertion order, and stats survive
    pub fn update(&self, id: &str, patch: RoutePatch) -> Result<Route, BusError> {
        let entry = self.entry(id)?;
        let mut patched = entry.spec.read().clone();
        patch.apply(&mut patched);
        patched.validate()?;
        *entry.spec.write() = patched;
        Self::sort(&mut self.routes.write());

        let snapshot = entry.snapshot();
        info!(route = %snapshot.spec.name, id, "route updated");
        self.notify(&RouteChange::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Remove a route by id
    pub fn remove(&self, id: &str) -> Result<(), BusError> {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|e| e.id != id);
        if routes.len() == before {
            return Err(BusError::RouteNotFound(id.to_string()));
        }
        drop(routes);
        info!(id, "route removed");
        self.notify(&RouteChange::Removed(id.to_string()));
        Ok(())
    }

    /// Enable a route by id
    pub fn enable(&self, id: &str) -> Result<(), BusError> {
        self.set_route_enabled(id, true)
    }

    /// Disable a route by id; it stays in the table but is not evaluated
    pub fn disable(&self, id: &str) -> Result<(), BusError> {
        self.set_route_enabled(id, false)
    }

    fn set_route_enabled(&self, id: &str, enabled: bool) -> Result<(), BusError> {
        let entry = self.entry(id)?;
        entry.spec.write().enabled = enabled;
        let change = if enabled {
            RouteChange::Enabled(id.to_string())
        } else {
            RouteChange::Disabled(id.to_string())
        };
        self.notify(&change);
        Ok(())
    }

    /// Fetch one route by id
    pub fn get(&self, id: &str) -> Option<Route> {
        self.routes
            .read()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.snapshot())
    }

    /// List routes in evaluation order, optionally filtered
    pub fn list(&self, filter: Option<&RouteFilter>) -> Vec<Route> {
        self.routes
            .read()
            .iter()
            .map(|e| e.snapshot())
            .filter(|r| match filter {
                None => true,
                Some(f) => {
                    f.enabled.is_none_or(|want| r.spec.enabled == want)
                        && f.name_prefix
                            .as_deref()
                            .is_none_or(|p| r.spec.name.starts_with(p))
                }
            })
            .collect()
    }

    /// Remove every route
    pub fn clear(&self) {
        self.routes.write().clear();
        info!("routes cleared");
        self.notify(&RouteChange::Cleared);
    }

    /// Number of stored routes
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Switch evaluation on or off engine-wide (routes are kept)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Registration tables
    // ------------------------------------------------------------------

    /// Register a transform function for `map`/`custom` transforms
    pub fn register_transform(&self, fn_id: impl Into<String>, f: TransformFn) {
        self.transforms.register(fn_id, f);
    }

    /// Register a CALL handler
    pub fn register_handler(&self, handler_id: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        self.handlers.write().insert(handler_id.into(), handler);
    }

    /// Register a synchronous closure as a CALL handler
    pub fn register_handler_fn<F>(&self, handler_id: impl Into<String>, f: F)
    where
        F: Fn(Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(handler_id, Arc::new(FnHandler(f)));
    }

    // ------------------------------------------------------------------
    // Listeners / stats
    // ------------------------------------------------------------------

    /// Register a route-table change listener
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&RouteChange) + Send + Sync + 'static,
    {
        self.change_listeners.write().push(Arc::new(listener));
    }

    /// Register a listener for isolated evaluation failures
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        self.error_listeners.write().push(Arc::new(listener));
    }

    /// Engine statistics snapshot
    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            routes_evaluated: self.counters.evaluated.load(Ordering::Relaxed),
            routes_matched: self.counters.matched.load(Ordering::Relaxed),
            actions_executed: self.counters.actions.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Zero the statistics; route definitions are untouched
    pub fn reset_stats(&self) {
        self.counters.evaluated.store(0, Ordering::Relaxed);
        self.counters.matched.store(0, Ordering::Relaxed);
        self.counters.actions.store(0, Ordering::Relaxed);
        self.counters.errors.store(0, Ordering::Relaxed);
        for entry in self.routes.read().iter() {
            entry.evaluated.store(0, Ordering::Relaxed);
            entry.matched.store(0, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate every enabled route against `message`
    ///
    /// Called by the bus at the end of each publish. Ordering: ascending
    /// `order`, then insertion. Re-entrant evaluations triggered by
    /// EMIT/FORWARD run depth-first up to the configured depth cap.
    pub(crate) fn evaluate(self: &Arc<Self>, message: &Message) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        let depth = EVAL_DEPTH.with(Cell::get);
        if depth >= self.max_depth {
            self.report(BusError::ActionError {
                route: "routing".into(),
                cause: format!("max routing depth {} exceeded on '{}'", self.max_depth, message.topic),
            });
            return;
        }
        EVAL_DEPTH.with(|d| d.set(depth + 1));

        let entries: Vec<Arc<RouteEntry>> = self.routes.read().clone();
        for entry in entries {
            let spec = entry.spec.read().clone();
            if !spec.enabled {
                continue;
            }
            self.counters.evaluated.fetch_add(1, Ordering::Relaxed);
            entry.evaluated.fetch_add(1, Ordering::Relaxed);

            match Self::matches(&spec.match_spec, message) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(cause) => {
                    self.report(BusError::PredicateError { route: spec.name.clone(), cause });
                    continue;
                }
            }
            self.counters.matched.fetch_add(1, Ordering::Relaxed);
            entry.matched.fetch_add(1, Ordering::Relaxed);
            debug!(route = %spec.name, topic = %message.topic, "route matched");

            let subject = match &spec.transform {
                None => message.clone(),
                Some(t) => match self.transforms.apply(t, message) {
                    Ok(m) => m,
                    Err(TransformFailure::NotFound(id)) => {
                        self.report(BusError::TransformNotFound(id));
                        continue;
                    }
                    Err(TransformFailure::Failed(cause)) => {
                        self.report(BusError::TransformError { route: spec.name.clone(), cause });
                        continue;
                    }
                },
            };

            for action_spec in &spec.actions {
                self.counters.actions.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.execute(action_spec, &subject, &spec.name) {
                    self.report(err);
                }
            }
        }

        EVAL_DEPTH.with(|d| d.set(depth));
    }

    fn matches(spec: &MatchSpec, message: &Message) -> Result<bool, String> {
        let topic_ok = |alternatives: &super::spec::OneOrMany| {
            alternatives
                .iter()
                .any(|p| vayla_core::topic::matches(&message.topic, p))
        };
        if let Some(topics) = &spec.topic {
            if !topic_ok(topics) {
                return Ok(false);
            }
        }
        if let Some(types) = &spec.message_type {
            if !topic_ok(types) {
                return Ok(false);
            }
        }
        if let Some(source) = &spec.source {
            if message.source() != Some(source.as_str()) {
                return Ok(false);
            }
        }
        if let Some(any) = &spec.tags_any {
            let tags = message.tags();
            if !any.iter().any(|t| tags.contains(&t.as_str())) {
                return Ok(false);
            }
        }
        if let Some(all) = &spec.tags_all {
            let tags = message.tags();
            if !all.iter().all(|t| tags.contains(&t.as_str())) {
                return Ok(false);
            }
        }
        if let Some(pred) = &spec.where_clause {
            if !predicate::eval(pred, message)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn execute(
        self: &Arc<Self>,
        action_spec: &ActionSpec,
        subject: &Message,
        route: &str,
    ) -> Result<(), BusError> {
        match action_spec {
            ActionSpec::Emit { message, inherit } => {
                let emitted = action::build_emit(message, inherit, subject).map_err(|cause| {
                    BusError::ActionError { route: route.to_string(), cause }
                })?;
                self.republish(emitted, route)
            }
            ActionSpec::Forward { topic, type_override } => {
                let mut forwarded = subject.clone();
                forwarded.topic = topic.clone();
                if let Some(t) = type_override {
                    forwarded.headers_mut().insert("type".into(), t.clone());
                }
                self.republish(forwarded, route)
            }
            ActionSpec::Log { template, level } => {
                let rendered = action::render_template(template, subject);
                action::emit_log(*level, route, &rendered);
                Ok(())
            }
            ActionSpec::Call { handler } => {
                let Some(handler_ref) = self.handlers.read().get(handler).map(Arc::clone) else {
                    return Err(BusError::HandlerNotFound(handler.clone()));
                };
                self.invoke_handler(handler_ref, subject.clone(), route);
                Ok(())
            }
        }
    }

    fn republish(self: &Arc<Self>, message: Message, route: &str) -> Result<(), BusError> {
        let Some(bus) = self.bus.upgrade() else {
            // bus torn down mid-evaluation; nothing left to publish to
            return Ok(());
        };
        bus.publish_routed(message)
            .map(|_| ())
            .map_err(|e| BusError::ActionError {
                route: route.to_string(),
                cause: e.to_string(),
            })
    }

    /// Fire a CALL handler without blocking route evaluation
    ///
    /// On a tokio runtime the call is spawned and its eventual failure is
    /// reported through the error listeners; outside a runtime it runs to
    /// completion inline.
    fn invoke_handler(self: &Arc<Self>, handler: Arc<dyn RouteHandler>, message: Message, route: &str) {
        let route = route.to_string();
        let engine: Weak<RoutingEngine> = Arc::downgrade(self);
        let fut = async move {
            if let Err(cause) = handler.call(message).await {
                if let Some(engine) = engine.upgrade() {
                    engine.report(BusError::ActionError {
                        route,
                        cause: cause.to_string(),
                    });
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(fut);
            }
            Err(_) => futures::executor::block_on(fut),
        }
    }

    fn report(&self, err: BusError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(code = err.code(), error = %err, "routing error");
        let listeners: Vec<ErrorListener> = self.error_listeners.read().clone();
        for listener in listeners {
            listener(&err);
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.report(&err);
        }
    }

    fn notify(&self, change: &RouteChange) {
        let listeners: Vec<ChangeListener> = self.change_listeners.read().clone();
        for listener in listeners {
            listener(change);
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<RouteEntry>, BusError> {
        self.routes
            .read()
            .iter()
            .find(|e| e.id == id)
            .map(Arc::clone)
            .ok_or_else(|| BusError::RouteNotFound(id.to_string()))
    }

    fn sort(routes: &mut [Arc<RouteEntry>]) {
        routes.sort_by_key(|e| (e.spec.read().order, e.seq));
    }
}
