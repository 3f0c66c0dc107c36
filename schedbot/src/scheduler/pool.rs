// Bounded worker pool backed by a semaphore of execution slots

use crate::config::SaturationPolicy;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Outcome of asking the pool for an execution slot
#[derive(Debug)]
pub enum SlotRequest {
    Granted(WorkerSlot),
    /// Every slot is busy and the pool rejects instead of waiting
    Saturated,
    /// The pool was closed by shutdown
    Closed,
}

/// One execution slot; released when dropped
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

/// Fixed number of concurrent execution slots.
///
/// Executions themselves run as tasks on the tokio runtime; the pool bounds
/// how many of them are in flight at once.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    policy: SaturationPolicy,
}

impl WorkerPool {
    pub fn new(size: usize, policy: SaturationPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            policy,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Ask for a slot, waiting for one in block mode
    pub async fn request_slot(&self) -> SlotRequest {
        match self.policy {
            SaturationPolicy::Block => match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => SlotRequest::Granted(WorkerSlot { _permit: permit }),
                Err(_) => SlotRequest::Closed,
            },
            SaturationPolicy::Reject => match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => SlotRequest::Granted(WorkerSlot { _permit: permit }),
                Err(TryAcquireError::NoPermits) => {
                    debug!(pool_size = self.size, "Worker pool saturated");
                    SlotRequest::Saturated
                }
                Err(TryAcquireError::Closed) => SlotRequest::Closed,
            },
        }
    }

    /// Refuse further slot requests and wake a dispatcher waiting for one.
    /// Slots already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reject_mode_reports_saturation() {
        let pool = WorkerPool::new(1, SaturationPolicy::Reject);
        let first = pool.request_slot().await;
        assert!(matches!(first, SlotRequest::Granted(_)));
        assert_eq!(pool.available(), 0);

        assert!(matches!(pool.request_slot().await, SlotRequest::Saturated));

        drop(first);
        assert!(matches!(pool.request_slot().await, SlotRequest::Granted(_)));
    }

    #[tokio::test]
    async fn test_block_mode_waits_for_release() {
        let pool = Arc::new(WorkerPool::new(1, SaturationPolicy::Block));
        let held = pool.request_slot().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { matches!(pool.request_slot().await, SlotRequest::Granted(_)) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_request() {
        let pool = Arc::new(WorkerPool::new(1, SaturationPolicy::Block));
        let _held = pool.request_slot().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { matches!(pool.request_slot().await, SlotRequest::Closed) })
        };

        tokio::task::yield_now().await;
        pool.close();
        assert!(pool.is_closed());
        assert!(waiter.await.unwrap());
    }
}
