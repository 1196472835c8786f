//! Resource management

use crate::error::H5LensError;

use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate various resources
/// to tasks. Resource management is performed using a Tokio Semaphore for each type of resource.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for S3 connections, shared with the object store.
    s3_connections: Option<Arc<Semaphore>>,

    /// Optional semaphore for blocking extraction tasks.
    tasks: Option<Semaphore>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(s3_connection_limit: Option<usize>, task_limit: Option<usize>) -> Self {
        Self {
            s3_connections: s3_connection_limit.map(|limit| Arc::new(Semaphore::new(limit))),
            tasks: task_limit.map(Semaphore::new),
        }
    }

    /// Acquire an S3 connection resource.
    pub async fn s3_connection(&self) -> Result<Option<SemaphorePermit>, H5LensError> {
        optional_acquire(self.s3_connections.as_deref()).await
    }

    /// The S3 connection semaphore, for ranged reads made outside a request handler.
    pub fn s3_connection_limiter(&self) -> Option<Arc<Semaphore>> {
        self.s3_connections.clone()
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<SemaphorePermit>, H5LensError> {
        optional_acquire(self.tasks.as_ref()).await
    }
}

/// Acquire a permit on an optional Semaphore, if present.
async fn optional_acquire(sem: Option<&Semaphore>) -> Result<Option<SemaphorePermit>, H5LensError> {
    match sem {
        Some(sem) => sem.acquire().await.map(Some).map_err(|err| err.into()),
        None => Ok(None),
    }
}
