//! Global limiter for concurrent image transformations.
//!
//! Transformations are CPU- and memory-expensive; a burst of cache misses
//! could otherwise start an unbounded number of them. The throttler wraps a
//! semaphore: the pipeline acquires a permit around the transformation step
//! and a denial turns into a 503 for the client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Bounds the number of transformations running at once.
#[derive(Debug)]
pub struct TransformThrottler {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
}

/// A held transformation slot; dropping it releases the slot.
pub struct TransformPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for TransformPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl TransformThrottler {
    /// Creates a throttler allowing `capacity` concurrent transformations.
    /// A zero capacity denies every acquisition.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Acquires a transformation slot, waiting until one frees up or the
    /// request is cancelled. Returns `None` on denial.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<TransformPermit> {
        if self.capacity == 0 {
            return None;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.expect("throttler semaphore closed unexpectedly")
            }
            _ = cancel.cancelled() => return None,
        };

        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.peak_in_flight.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_in_flight.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }

        Some(TransformPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of transformations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest concurrency observed since startup.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}
