//! Per-client publish rate limiting
//!
//! Each publishing client gets its own budget of `rate` messages per
//! second, enforced with a lock-free virtual-scheduling limiter (GCRA - the
//! token-bucket equivalent expressed as a single atomic deadline). A client
//! may burst a full second's budget at once; the budget then refills
//! continuously rather than in window steps.
//!
//! # Memory bounds
//!
//! Budgets for ephemeral clients would otherwise accumulate forever, so the
//! table is swept: `sweep()` drops budgets idle longer than the configured
//! interval, and inserts past `max_clients` evict the longest-idle budget
//! first.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Lock-free single-client budget
///
/// `tat` is the theoretical arrival time (in nanos since the limiter
/// started) of the next conforming message. A message conforms when it does
/// not push `tat` further than one burst ahead of now.
struct Budget {
    tat: AtomicU64,
    last_seen: AtomicU64,
}

impl Budget {
    fn new() -> Self {
        Self {
            tat: AtomicU64::new(0),
            last_seen: AtomicU64::new(0),
        }
    }

    fn try_acquire(&self, now_nanos: u64, increment: u64, tolerance: u64) -> bool {
        self.last_seen.store(now_nanos, Ordering::Relaxed);
        loop {
            let tat = self.tat.load(Ordering::Acquire);
            let base = tat.max(now_nanos);
            let new_tat = base.saturating_add(increment);
            if base > now_nanos.saturating_add(tolerance) {
                return false;
            }
            if self
                .tat
                .compare_exchange_weak(tat, new_tat, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Per-client rate limiter
pub(crate) struct RateLimiter {
    /// Messages per second per client; 0 disables limiting entirely
    rate: u64,
    /// Nanoseconds of budget one message consumes
    increment: u64,
    /// How far ahead of now the deadline may run (one second's burst)
    tolerance: u64,
    /// Hard cap on tracked clients
    max_clients: usize,
    start: Instant,
    budgets: RwLock<HashMap<String, Arc<Budget>>>,
    dropped: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        let increment = if rate == 0 { 0 } else { 1_000_000_000 / rate };
        Self {
            rate,
            increment,
            // a full second's worth of messages may arrive at once
            tolerance: increment.saturating_mul(rate.saturating_sub(1)),
            max_clients: 10_000,
            start: Instant::now(),
            budgets: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Charge one message to `client`; `false` means over budget
    pub fn try_acquire(&self, client: &str) -> bool {
        if self.rate == 0 {
            return true;
        }
        let now = self.start.elapsed().as_nanos() as u64;

        if let Some(budget) = self.budgets.read().get(client).map(Arc::clone) {
            let ok = budget.try_acquire(now, self.increment, self.tolerance);
            if !ok {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return ok;
        }

        let mut budgets = self.budgets.write();
        if budgets.len() >= self.max_clients && !budgets.contains_key(client) {
            Self::evict_idlest(&mut budgets);
        }
        let budget = budgets
            .entry(client.to_string())
            .or_insert_with(|| Arc::new(Budget::new()))
            .clone();
        drop(budgets);

        let ok = budget.try_acquire(now, self.increment, self.tolerance);
        if !ok {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Forget a client's budget (client teardown)
    pub fn forget(&self, client: &str) {
        self.budgets.write().remove(client);
    }

    /// Drop budgets idle for more than `idle_for_nanos`
    ///
    /// Called by the periodic cleanup sweep. Purely bookkeeping: a swept
    /// client that publishes again starts from a fresh (full) budget.
    pub fn sweep(&self, idle_for_nanos: u64) -> usize {
        let now = self.start.elapsed().as_nanos() as u64;
        let mut budgets = self.budgets.write();
        let before = budgets.len();
        budgets.retain(|_, b| {
            now.saturating_sub(b.last_seen.load(Ordering::Relaxed)) < idle_for_nanos
        });
        let swept = before - budgets.len();
        if swept > 0 {
            debug!(swept, "swept idle rate budgets");
        }
        swept
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn tracked_clients(&self) -> usize {
        self.budgets.read().len()
    }

    fn evict_idlest(budgets: &mut HashMap<String, Arc<Budget>>) {
        let idlest = budgets
            .iter()
            .min_by_key(|(_, b)| b.last_seen.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone());
        if let Some(key) = idlest {
            budgets.remove(&key);
        }
    }
}
