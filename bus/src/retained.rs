//! Retained message store
//!
//! Bounded topic → last-retained-message cache. Late subscribers replay
//! matching entries to recover current state without waiting for the next
//! publish.
//!
//! # Eviction
//!
//! Recency is publish recency: every `put` (insert or overwrite) stamps the
//! entry with a monotonic sequence number, and when the store would exceed
//! its capacity the entry with the *oldest* stamp is evicted - exactly one
//! per overflow. Reads do not refresh recency. The scan is O(n), which is
//! fine at the configured capacities (hundreds to a few thousand entries);
//! overflow is the rare path.

use std::collections::HashMap;
use tracing::debug;
use vayla_core::{topic, Message};

struct Entry {
    seq: u64,
    message: Message,
}

/// Bounded store of the last retained message per topic
pub struct RetainedStore {
    capacity: usize,
    seq: u64,
    entries: HashMap<String, Entry>,
}

impl RetainedStore {
    /// Create a store holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seq: 0,
            entries: HashMap::new(),
        }
    }

    /// Store `message` as the retained value for its topic
    ///
    /// Overwrites any existing entry for the same topic and refreshes its
    /// recency. Evicts the least-recently-published entry when the insert
    /// would exceed capacity.
    pub fn put(&mut self, message: Message) {
        if self.capacity == 0 {
            return;
        }

        self.seq += 1;
        let seq = self.seq;
        let topic = message.topic.clone();
        let is_new = !self.entries.contains_key(&topic);

        if is_new && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        self.entries.insert(topic, Entry { seq, message });
    }

    /// Get the retained message for an exact topic
    pub fn get(&self, topic: &str) -> Option<&Message> {
        self.entries.get(topic).map(|e| &e.message)
    }

    /// All retained messages whose topic matches `pattern`, in ascending
    /// publish-recency order (oldest first)
    pub fn all_matching(&self, pattern: &str) -> Vec<Message> {
        self.all_matching_any(&[pattern])
    }

    /// All retained messages matching any of `patterns`, in ascending
    /// publish-recency order; each entry appears once even when several
    /// patterns match it
    pub fn all_matching_any(&self, patterns: &[&str]) -> Vec<Message> {
        let mut hits: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|(t, _)| patterns.iter().any(|p| topic::matches(t, p)))
            .map(|(_, e)| e)
            .collect();
        hits.sort_by_key(|e| e.seq);
        hits.iter().map(|e| e.message.clone()).collect()
    }

    /// Remove entries matching `pattern`; `None` clears everything.
    /// Returns the number of entries removed.
    pub fn clear_matching(&mut self, pattern: Option<&str>) -> usize {
        match pattern {
            None => {
                let n = self.entries.len();
                self.entries.clear();
                n
            }
            Some(p) => {
                let before = self.entries.len();
                self.entries.retain(|t, _| !topic::matches(t, p));
                before - self.entries.len()
            }
        }
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.seq)
            .map(|(t, _)| t.clone());
        if let Some(topic) = oldest {
            self.entries.remove(&topic);
            debug!(%topic, "evicted retained entry");
        }
    }
}
