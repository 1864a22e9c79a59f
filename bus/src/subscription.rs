//! Subscription registry
//!
//! Insertion-ordered list of (pattern, handler) pairs. Insertion order *is*
//! delivery order: `find` returns matching handlers in the order their
//! subscriptions were added, and the returned snapshot is immune to
//! concurrent removals - an in-flight dispatch keeps delivering to the
//! handlers it saw at the start, even if one of them unsubscribes mid-loop.

use smallvec::SmallVec;
use std::sync::Arc;
use vayla_core::{topic, HandlerError, Message};

/// Subscriber callback type
///
/// Returning `Err` is the caught-and-isolated failure path: the bus counts
/// it, reports it, and keeps delivering to the remaining subscribers.
pub type SubscriberFn = dyn Fn(&Message) -> Result<(), HandlerError> + Send + Sync;

/// Token set identifying the subscriptions created by one `subscribe` call
pub type TokenSet = SmallVec<[u64; 2]>;

pub(crate) struct Subscription {
    token: u64,
    pattern: String,
    client_id: Option<String>,
    handler: Arc<SubscriberFn>,
}

/// One matching subscription, snapshotted for dispatch
pub(crate) struct Delivery {
    pub pattern: String,
    pub handler: Arc<SubscriberFn>,
}

/// Insertion-ordered subscription table
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_token: u64,
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `pattern`, returning its removal token
    pub fn add(
        &mut self,
        pattern: impl Into<String>,
        client_id: Option<String>,
        handler: Arc<SubscriberFn>,
    ) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.entries.push(Subscription {
            token,
            pattern: pattern.into(),
            client_id,
            handler,
        });
        token
    }

    /// Snapshot the handlers whose pattern matches `topic`, in insertion order
    pub fn find(&self, topic: &str) -> Vec<Delivery> {
        self.entries
            .iter()
            .filter(|s| topic::matches(topic, &s.pattern))
            .map(|s| Delivery {
                pattern: s.pattern.clone(),
                handler: Arc::clone(&s.handler),
            })
            .collect()
    }

    /// Remove the subscriptions identified by `tokens`; idempotent
    pub fn remove_tokens(&mut self, tokens: &[u64]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|s| !tokens.contains(&s.token));
        before - self.entries.len()
    }

    /// Remove subscriptions by pattern set, optionally scoped to a client
    ///
    /// `unsubscribe(["user.*"], Some("ui"))` removes only the `ui` client's
    /// `user.*` subscriptions; without a client id every subscription on a
    /// listed pattern goes. Removing nothing is a no-op, not an error.
    pub fn remove_matching(&mut self, patterns: &[&str], client_id: Option<&str>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|s| {
            let pattern_listed = patterns.contains(&s.pattern.as_str());
            let client_matches = match client_id {
                Some(c) => s.client_id.as_deref() == Some(c),
                None => true,
            };
            !(pattern_listed && client_matches)
        });
        before - self.entries.len()
    }

    /// Remove every subscription owned by `client_id` (client teardown)
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|s| s.client_id.as_deref() != Some(client_id));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
