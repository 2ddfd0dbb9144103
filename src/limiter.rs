//! Concurrency limiter
//!
//! Counting permit pool bounding how many optimizations run at once. Permits
//! are handed out without waiting and are returned when the [`JobPermit`]
//! guard is dropped, so every exit path of an execution (success, failure,
//! timeout, panic, shutdown) gives its permit back.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

/// Fixed-capacity permit pool.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Permit owned by one executing job.
#[derive(Debug)]
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    /// Create a pool with `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a permit if one is free. Never waits.
    pub fn try_acquire(&self) -> Option<JobPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(JobPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => {
                warn!("Concurrency limiter closed; refusing new work");
                None
            }
        }
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl JobPermit {
    /// Return the permit to the pool. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}
