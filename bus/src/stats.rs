//! Bus counters
//!
//! Plain atomics, not an exporter: `stats()` snapshots are the observable
//! surface of the bus. Counters only ever go up; gauges (subscriptions,
//! clients, retained) are sampled at snapshot time from their owning tables.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic dispatch counters, shared across the bus internals
#[derive(Debug, Default)]
pub(crate) struct Counters {
    /// Messages accepted by `publish`
    pub published: AtomicU64,
    /// Handler invocations that completed (one per subscriber per message)
    pub delivered: AtomicU64,
    /// Messages rejected by the per-client rate limit
    pub dropped_rate_limited: AtomicU64,
    /// Handler invocations that returned an error
    pub handler_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time bus statistics
///
/// Returned by `stats()`; reading has no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Messages accepted by `publish` since construction
    pub published: u64,
    /// Successful handler deliveries
    pub delivered: u64,
    /// Messages dropped by rate limiting
    pub dropped: u64,
    /// Handler invocations that failed (isolated errors)
    pub handler_errors: u64,
    /// Retained entries currently resident
    pub retained: usize,
    /// Active subscriptions
    pub subscriptions: usize,
    /// Registered clients
    pub clients: usize,
}
