//! Bounded session pool: capacity slots plus in-flight tracking for drain

use crate::error::{ProxyError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Capacity token; the slot is released when this is dropped
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

/// Fixed number of session slots and the set of session tasks in flight
#[derive(Clone)]
pub struct SessionPool {
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    capacity: usize,
}

impl SessionPool {
    /// Create a pool with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held by a session
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Session tasks spawned and not yet finished
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<PoolSlot> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::internal("session pool closed"))?;
        Ok(PoolSlot { _permit: permit })
    }

    /// Spawn a session task that drain will wait for
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Stop tracking new work and wait for every spawned task to exit
    pub async fn drain(&self) {
        self.tracker.close();
        debug!("Draining {} in-flight sessions", self.tracker.len());
        self.tracker.wait().await;
    }
}
