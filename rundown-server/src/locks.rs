//! Per-service serialization.
//!
//! Every write to a service (timer transitions and agenda edits alike) runs
//! while holding that service's [`ServiceGuard`]. Operations that need to be
//! composed under one lock take the guard by reference as proof.

use std::collections::HashMap;
use std::sync::Arc;

use rundown_proto::agenda::ServiceId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive access to one service's state.
#[derive(Debug)]
pub struct ServiceGuard {
    service_id: ServiceId,
    _guard: OwnedMutexGuard<()>,
}

impl ServiceGuard {
    /// Service this guard locks.
    #[must_use]
    pub const fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

/// Registry of per-service async mutexes.
#[derive(Debug, Default)]
pub struct ServiceLocks {
    locks: parking_lot::Mutex<HashMap<ServiceId, Arc<Mutex<()>>>>,
}

impl ServiceLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `service_id`.
    pub async fn acquire(&self, service_id: ServiceId) -> ServiceGuard {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(service_id).or_default())
        };
        ServiceGuard {
            service_id,
            _guard: lock.lock_owned().await,
        }
    }

    /// Drops the mutex for a deleted service once nobody holds or waits on it.
    pub fn release(&self, service_id: ServiceId) {
        let mut locks = self.locks.lock();
        if locks
            .get(&service_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&service_id);
        }
    }

    /// Number of services with a live mutex.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no service has a live mutex.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
