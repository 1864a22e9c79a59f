//! Shared fixtures for the black-box E2E tests
//!
//! Everything here talks to the bus through the public facade only - no
//! reaching into engine internals. Tests build isolated `MessageBus`
//! instances, so they can run in parallel without bleeding state.

#![allow(clippy::unwrap_used)]

use parking_lot::Mutex;
use std::sync::Arc;
use vayla_bus::MessageBus;
use vayla_core::Message;

/// A subscriber that records everything it receives
#[derive(Clone, Default)]
pub struct CaptureSubscriber {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl CaptureSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to `bus` on the given patterns
    pub fn attach(&self, bus: &MessageBus, patterns: &[&str]) {
        let sink = Arc::clone(&self.messages);
        bus.subscribe(patterns, move |msg: &Message| {
            sink.lock().push(msg.clone());
            Ok(())
        })
        .unwrap();
    }

    /// Attach with retained replay
    pub fn attach_retained(&self, bus: &MessageBus, patterns: &[&str]) {
        let sink = Arc::clone(&self.messages);
        bus.subscribe_with(
            patterns,
            vayla_bus::SubscribeOptions { retained: true, ..Default::default() },
            move |msg: &Message| {
                sink.lock().push(msg.clone());
                Ok(())
            },
        )
        .unwrap();
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn take_all(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.topic.clone()).collect()
    }
}

/// Collects error codes seen by the bus error listeners
pub fn error_codes(bus: &MessageBus) -> Arc<Mutex<Vec<&'static str>>> {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&codes);
    bus.on_error(move |err| sink.lock().push(err.code()));
    codes
}
