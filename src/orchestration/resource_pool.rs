//! Bounded pools for worker slots and scarce external resources

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// A named, fixed-size pool of permits
///
/// Waiting is bounded by the acquire timeout; running out of time is a
/// [`PipelineError::ResourceAcquisitionTimeout`] rather than a hang.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl ResourcePool {
    pub fn new(name: &'static str, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            acquire_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Suspend until a slot frees up or the timeout passes
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, PipelineError> {
        match timeout(self.acquire_timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(resource = self.name, available = self.available(), "Acquired resource slot");
                Ok(permit)
            }
            Ok(Err(_closed)) => Err(PipelineError::Cancelled),
            Err(_elapsed) => {
                warn!(
                    resource = self.name,
                    waited_ms = self.acquire_timeout.as_millis() as u64,
                    capacity = self.capacity,
                    "⏳ Timed out waiting for resource slot"
                );
                Err(PipelineError::ResourceAcquisitionTimeout {
                    resource: self.name.to_string(),
                    waited: self.acquire_timeout,
                })
            }
        }
    }

    /// Suspend until a slot frees up, without a deadline
    pub async fn acquire_unbounded(&self) -> Result<OwnedSemaphorePermit, PipelineError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_closed| PipelineError::Cancelled)
    }

    /// Stop handing out permits; waiters fail with `Cancelled`
    pub fn close(&self) {
        self.semaphore.close();
    }
}
