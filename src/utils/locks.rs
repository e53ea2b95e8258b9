// pgbackup/src/utils/locks.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Set of backup definitions with a run in flight.
///
/// Check-and-insert happens under one mutex, so two triggers for the same
/// definition can never both obtain a guard.
#[derive(Debug, Default)]
pub struct InFlight {
    active: Mutex<HashSet<Uuid>>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>, id: Uuid) -> Option<InFlightGuard> {
        if !self.active.lock().insert(id) {
            return None;
        }
        Some(InFlightGuard {
            owner: Arc::clone(self),
            id,
        })
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.active.lock().contains(&id)
    }
}

/// Releases the definition when dropped, on every exit path.
#[derive(Debug)]
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.active.lock().remove(&self.id);
    }
}

/// Per-record async locks, created on demand.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // Entries nobody holds or waits on can go.
            locks.retain(|key, lock| *key == id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }
}
