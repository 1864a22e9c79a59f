//! vayla-core - Core types for the VAYLA message bus
//!
//! This crate provides the foundational types shared between the bus engine
//! and external collaborators (module hosts, adapters, route handlers):
//!
//! - [`Message`] - the universal bus envelope (topic + JSON payload + headers)
//! - [`BusError`] - the error taxonomy with stable string codes
//! - [`HandlerError`] - the error type subscriber callbacks report back
//! - [`topic`] - topic validation and dotted wildcard matching
//!
//! # Why this crate exists
//!
//! Collaborators that only *consume* the bus (a subscriber module, a route
//! handler plugin) need the envelope and error types but none of the engine
//! machinery. Keeping those types here means such code depends on a small,
//! stable crate instead of pulling in the whole of `vayla-bus`.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
/// The universal message envelope
pub mod message;
/// Topic validation and dotted wildcard matching
pub mod topic;

pub use error::{BusError, HandlerError};
pub use message::{Headers, Message};
pub use topic::{is_valid_pattern, is_valid_topic, matches};
