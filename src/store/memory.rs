//! In-process presence store.
//!
//! Backs tests and single-node development. A swap is a constant-time map
//! operation under a short synchronous lock (never held across `.await`),
//! and the change is published while that lock is held so the broadcast
//! order equals commit order.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    CHANGE_CHANNEL_CAPACITY, CasOutcome, Observed, PresenceStore, RoomChange, StoreError, StoreEvent, Versioned,
};
use crate::state::{Room, RoomCode};

pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    changes: broadcast::Sender<StoreEvent>,
}

struct MemoryInner {
    rooms: HashMap<RoomCode, Versioned<Room>>,
    /// Last revision handed out. Never reused, even across deletes.
    revision: u64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { inner: Mutex::new(MemoryInner { rooms: HashMap::new(), revision: 0 }), changes }
    }

    /// Number of live rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every watcher to re-read, as a backend does after losing its feed.
    #[cfg(test)]
    pub fn publish_resync(&self) {
        let _ = self.changes.send(StoreEvent::Resync);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn load(&self, code: &RoomCode) -> Result<Option<Versioned<Room>>, StoreError> {
        Ok(self.lock().rooms.get(code).cloned())
    }

    async fn observe(&self, code: &RoomCode) -> Result<Observed, StoreError> {
        let inner = self.lock();
        Ok(Observed { room: inner.rooms.get(code).cloned(), revision: inner.revision })
    }

    async fn compare_and_swap(
        &self,
        code: &RoomCode,
        expected: Option<u64>,
        next: Option<Room>,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.lock();

        let current = inner.rooms.get(code).map(|v| v.version);
        if current != expected || (expected.is_none() && next.is_none()) {
            return Ok(CasOutcome::Conflict);
        }

        inner.revision += 1;
        let version = inner.revision;
        match &next {
            Some(room) => {
                inner
                    .rooms
                    .insert(code.clone(), Versioned { version, value: room.clone() });
            }
            None => {
                inner.rooms.remove(code);
            }
        }

        // No receivers is not an error: nobody is watching this store yet.
        let _ = self
            .changes
            .send(StoreEvent::Changed(RoomChange { code: code.clone(), version, room: next }));
        Ok(CasOutcome::Committed { version })
    }

    async fn list_codes(&self) -> Result<Vec<RoomCode>, StoreError> {
        let mut codes: Vec<RoomCode> = self.lock().rooms.keys().cloned().collect();
        codes.sort();
        Ok(codes)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
