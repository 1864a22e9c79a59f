//! Declarative routing engine
//!
//! A small rule interpreter layered on the bus: runtime-configurable routes
//! match published messages against predicates, optionally transform them,
//! and trigger side-effecting actions - without the publishing or consuming
//! code knowing the routes exist.
//!
//! # Rule pipeline
//!
//! ```text
//! message ──► match? ──► transform ──► actions (in array order)
//!               │            │            ├─ EMIT     publish from template
//!               │            │            ├─ FORWARD  re-publish, new topic
//!               │            │            ├─ LOG      render + tracing
//!               │            │            └─ CALL     registered handler
//!               ▼            ▼
//!        PREDICATE_ERROR  TRANSFORM_*     (every failure isolated per
//!        (route skipped)  (actions skipped)  route/action, reported)
//! ```
//!
//! Routes are serde tagged unions, so JSON-authored rules deserialize
//! straight into the typed AST and are validated at registration time, not
//! at evaluation time.

mod action;
mod engine;
mod path;
mod predicate;
mod spec;
mod transform;

pub use engine::{RouteChange, RouteFilter, RouteHandler, RoutingEngine, RoutingStats};
pub use spec::{
    ActionSpec, LogLevel, MatchSpec, OneOrMany, Predicate, Route, RoutePatch, RouteSpec,
    TransformSpec,
};
pub use transform::TransformFn;
