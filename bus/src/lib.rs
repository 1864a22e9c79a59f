//! VAYLA - In-Process Message Bus
//!
//! Decoupled many-to-many communication for modules that must not reference
//! each other, plus a declarative routing engine for reconfiguring message
//! flow at runtime without touching caller code.
//!
//! # Architecture
//!
//! ```text
//! publish ──► validate ──► rate limit ──► retained store
//!                                             │
//!                          subscriptions ◄────┤
//!                          (ordered fan-out)  │
//!                                             ▼
//!                                       routing engine
//!                                  match ─► transform ─► act
//!                                  (EMIT/FORWARD re-enter publish)
//! ```
//!
//! Dispatch is synchronous and depth-first: subscribers and routes run in
//! the caller's call stack, in deterministic order, and nested publishes
//! from handlers or actions complete before the outer dispatch continues.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use vayla_bus::MessageBus;
//! use vayla_core::Message;
//!
//! let bus = MessageBus::builder().build();
//! let handle = bus
//!     .subscribe(&["user.*"], |msg: &Message| {
//!         println!("got {}", msg.topic);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! bus.publish(Message::new("user.login", json!({"id": 1}))).unwrap();
//! bus.unsubscribe_handle(handle);
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod bus;
pub mod clock;
pub mod config;
pub mod facade;
mod rate_limit;
pub mod retained;
pub mod routing;
pub mod stats;
pub mod subscription;

pub use bus::{Bus, ErrorListener, SubscribeOptions, SubscriptionHandle};
pub use clock::{Clock, IdSource, ManualClock, SystemClock, UlidIds};
pub use config::BusConfig;
pub use facade::{MessageBus, MessageBusBuilder};
pub use routing::{
    ActionSpec, LogLevel, MatchSpec, OneOrMany, Predicate, Route, RouteChange, RouteFilter,
    RouteHandler, RoutePatch, RouteSpec, RoutingEngine, RoutingStats, TransformFn, TransformSpec,
};
pub use stats::BusStats;

// Re-export the shared envelope/error types so consumers need one import.
pub use vayla_core::{BusError, HandlerError, Message};
