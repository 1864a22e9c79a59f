//! Time and id injection seams
//!
//! The bus stamps `ts` and `id` onto published messages as a side effect.
//! Both come in through these traits so tests can pin time and ids instead
//! of sleeping or pattern-matching generated strings.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Wall-clock time source
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// Unique id source for message, route, and correlation ids
pub trait IdSource: Send + Sync {
    /// Produce the next unique id
    fn next_id(&self) -> String;
}

/// System clock backed by `chrono::Utc`
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// ULID-based id source
///
/// ULIDs sort by creation time, which keeps generated message ids readable
/// in traces and logs.
#[derive(Debug, Default)]
pub struct UlidIds;

impl IdSource for UlidIds {
    fn next_id(&self) -> String {
        ulid::Ulid::new().to_string()
    }
}

/// Fixed-step test clock
///
/// Starts at an arbitrary epoch and advances only when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a manual clock pinned at `start_ms`
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_ms),
        })
    }

    /// Advance the clock by `ms` milliseconds
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
