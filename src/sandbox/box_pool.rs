//! Box id allocation
//!
//! Isolate boxes share a cgroup and a workspace per id, so two live cells on
//! the same id corrupt each other. The pool is the only place ids come from:
//! a lock-protected free list guarded by a semaphore, handing out RAII leases.
//! At most `count` leases exist at once and no two of them carry the same id.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error};

use crate::error::{EngineError, Result};

struct PoolInner {
    free: Mutex<VecDeque<u32>>,
    permits: Arc<Semaphore>,
}

/// Pop a free id under an already acquired permit
fn take(inner: &Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Result<BoxLease> {
    let id = inner
        .free
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
        .ok_or(EngineError::BoxPoolExhausted)?;

    debug!("Leased box id {}", id);
    Ok(BoxLease {
        id,
        pool: Arc::clone(inner),
        permit: Some(permit),
    })
}

/// Process-wide table of box ids
#[derive(Clone)]
pub struct BoxPool {
    inner: Arc<PoolInner>,
}

impl BoxPool {
    /// Pool over `first..first + count`
    pub fn new(first: u32, count: u32) -> Self {
        let free: VecDeque<u32> = (first..first.saturating_add(count)).collect();
        let permits = Arc::new(Semaphore::new(free.len()));
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                permits,
            }),
        }
    }

    /// Wait until an id is free and lease it
    pub async fn acquire(&self) -> Result<BoxLease> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::BoxPoolExhausted)?;
        take(&self.inner, permit)
    }

    /// Lease an id without waiting
    pub fn try_acquire(&self) -> Result<BoxLease> {
        let permit = Arc::clone(&self.inner.permits)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits | TryAcquireError::Closed => {
                    EngineError::BoxPoolExhausted
                }
            })?;
        take(&self.inner, permit)
    }

    /// Number of ids currently free
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive hold on one box id. Dropping it returns the id to the pool.
pub struct BoxLease {
    id: u32,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl BoxLease {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Retire the id for the rest of the process lifetime. Used when the box
    /// behind it could not be torn down and may still exist on the host.
    pub fn quarantine(mut self) {
        if let Some(permit) = self.permit.take() {
            permit.forget();
            error!("Box id {} quarantined; pool capacity reduced", self.id);
        }
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        // The id must be back in the free list before the permit is released,
        // otherwise a waiter could wake up to an empty list.
        if let Some(permit) = self.permit.take() {
            self.pool
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(self.id);
            drop(permit);
            debug!("Released box id {}", self.id);
        }
    }
}

impl std::fmt::Debug for BoxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxLease").field("id", &self.id).finish()
    }
}
