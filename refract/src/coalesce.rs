//! Single-flight collapsing of concurrent derivative requests.
//!
//! When multiple requests arrive for the same derivative key at once, only
//! one production runs. The first caller to lock a key becomes the leader
//! and produces the response; every other caller joins the waiter set and
//! receives a detached copy of the leader's result.
//!
//! # Architecture
//!
//! ```text
//! Request A ─┐
//!            │                              Pipeline
//! Request B ─┼──► RequestCoalescer ──────► (leader only)
//!            │        │                        │
//! Request C ─┘        │                        │
//!                     ▼                        ▼
//!               [B, C receive a           [one production]
//!                copy of A's result]◄─────────┘
//! ```
//!
//! Deliveries happen outside the table's critical section: the waiter set
//! is detached from the map first, then each waiter gets its own copy over
//! a dedicated oneshot channel.

use crate::response::Response;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Keyed single-flight lock table.
///
/// The coalescer is agnostic to what a key means; it only guarantees that
/// at most one leader holds a given key at a time and that every waiter
/// observes exactly one of: a delivered response, a closed-empty channel,
/// or its own cancellation.
pub struct RequestCoalescer {
    in_flight: Arc<DashMap<String, Vec<Waiter>>>,
    total_requests: AtomicU64,
    collapsed_requests: AtomicU64,
    leader_requests: AtomicU64,
}

struct Waiter {
    tx: oneshot::Sender<Response>,
    cancelled: Arc<AtomicBool>,
}

/// Outcome of attempting to lock a key.
pub enum LockOutcome {
    /// Caller is the leader: run the pipeline, then publish via
    /// [`LeaderGuard::notify_and_release`].
    Leader(LeaderGuard),
    /// Another request holds the key: wait on the handle for its result.
    Waiter(LockResult),
}

impl LockOutcome {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }
}

/// Held by the leader until the production finishes.
///
/// Publishing consumes the guard, so a double release is impossible. If the
/// guard is dropped without publishing (the leader task was cancelled or
/// timed out), the key is released and all waiter channels close empty,
/// which tells waiters to retry inline.
pub struct LeaderGuard {
    key: String,
    in_flight: Arc<DashMap<String, Vec<Waiter>>>,
    released: bool,
}

impl LeaderGuard {
    /// Sends a detached copy of `response` to every waiter still
    /// interested, then releases the key. Cancelled waiters are skipped;
    /// their channels close when the waiter set drops.
    pub fn notify_and_release(mut self, response: &Response) {
        self.released = true;
        let Some((_, waiters)) = self.in_flight.remove(&self.key) else {
            return;
        };
        let mut delivered = 0usize;
        for waiter in waiters {
            if waiter.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if waiter.tx.send(response.copy()).is_ok() {
                delivered += 1;
            }
        }
        if delivered > 0 {
            debug!(key = %self.key, waiters = delivered, "delivered result to collapsed waiters");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.released {
            // Leader died before publishing; waiters see closed channels.
            if self.in_flight.remove(&self.key).is_some() {
                debug!(key = %self.key, "leader dropped without result, releasing key");
            }
        }
    }
}

/// Waiter-side handle for a collapsed request.
pub struct LockResult {
    /// Delivers exactly one response, or closes empty if the leader failed.
    pub response: oneshot::Receiver<Response>,
    /// Detaches this waiter from the leader's delivery.
    pub cancel: CancelHandle,
}

/// Single-shot detach signal for a waiter.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Marks the waiter as gone. The coalescer will not deliver to it; any
    /// in-flight send is discarded when the receiver drops.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            total_requests: AtomicU64::new(0),
            collapsed_requests: AtomicU64::new(0),
            leader_requests: AtomicU64::new(0),
        }
    }

    /// Attempts to lock `key`.
    ///
    /// The entry API makes the check-and-insert atomic, so exactly one
    /// concurrent caller becomes the leader.
    pub fn lock(&self, key: &str) -> LockOutcome {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match self.in_flight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let (tx, rx) = oneshot::channel();
                let cancelled = Arc::new(AtomicBool::new(false));
                entry.get_mut().push(Waiter {
                    tx,
                    cancelled: Arc::clone(&cancelled),
                });
                self.collapsed_requests.fetch_add(1, Ordering::Relaxed);
                debug!(key, "lock not acquired, joining waiter set");
                LockOutcome::Waiter(LockResult {
                    response: rx,
                    cancel: CancelHandle(cancelled),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Vec::new());
                self.leader_requests.fetch_add(1, Ordering::Relaxed);
                debug!(key, in_flight = self.in_flight.len(), "lock acquired");
                LockOutcome::Leader(LeaderGuard {
                    key: key.to_string(),
                    in_flight: Arc::clone(&self.in_flight),
                    released: false,
                })
            }
        }
    }

    /// Number of keys currently held.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Snapshot of coalescing statistics.
    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            collapsed_requests: self.collapsed_requests.load(Ordering::Relaxed),
            leader_requests: self.leader_requests.load(Ordering::Relaxed),
        }
    }

    /// Logs current statistics.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            total_requests = stats.total_requests,
            collapsed = stats.collapsed_requests,
            leaders = stats.leader_requests,
            in_flight = self.in_flight_count(),
            "request collapsing statistics"
        );
    }
}

impl Default for RequestCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for monitoring collapsing effectiveness.
#[derive(Debug, Default, Clone)]
pub struct CoalescerStats {
    pub total_requests: u64,
    pub collapsed_requests: u64,
    pub leader_requests: u64,
}

impl CoalescerStats {
    /// Fraction of requests that waited on existing work (0.0 to 1.0).
    pub fn collapse_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.collapsed_requests as f64 / self.total_requests as f64
        }
    }
}
