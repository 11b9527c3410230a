//! Presence store — versioned key-value tree of rooms.
//!
//! DESIGN
//! ======
//! Each room is one document keyed by its code. Writers never mutate in
//! place: they read a `Versioned<Room>`, compute the next document, and
//! `compare_and_swap` it against the version they read. A conflict means
//! another writer committed first and the caller must re-read.
//!
//! Versions come from one store-wide revision counter, so a room that is
//! deleted and later recreated under the same code never reuses a version.
//! A writer holding the old room's version can therefore never commit
//! against the new room.
//!
//! Every commit is published on a broadcast change stream in commit order
//! per room. Backends that cannot guarantee they saw every commit (lagging
//! receivers, dropped listener connections) publish `StoreEvent::Resync`
//! so observers re-read instead of diverging.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::state::{Room, RoomCode};

/// Capacity of the change broadcast channel per store.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed { version: u64 },
    Conflict,
}

/// A direct read together with the store revision it reflects.
///
/// Every commit to the read code at or below `revision` is already visible
/// in `room`. For an absent room this is the only ordering information a
/// reader gets, so observers use it as a watermark for older events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub room: Option<Versioned<Room>>,
    pub revision: u64,
}

/// One committed write. `room` is `None` when the write deleted the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomChange {
    pub code: RoomCode,
    pub version: u64,
    pub room: Option<Room>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Changed(RoomChange),
    /// Some commits may have gone unpublished; re-read what you observe.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt room document: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connectivity and timeout failures are worth retrying; bad data is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
                Self::Corrupt(e.to_string())
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_STORE_UNAVAILABLE",
            Self::Corrupt(_) => "E_STORE_CORRUPT",
        }
    }

    fn retryable(&self) -> bool {
        self.is_transient()
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Transactional room storage shared by every server instance.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Read one room with its current version.
    async fn load(&self, code: &RoomCode) -> Result<Option<Versioned<Room>>, StoreError>;

    /// Read one room plus the revision the read is current as of.
    async fn observe(&self, code: &RoomCode) -> Result<Observed, StoreError>;

    /// Atomically replace the room under `code`.
    ///
    /// - `expected: None` inserts only if the key is absent.
    /// - `next: None` deletes; deleting requires an expected version.
    ///
    /// The swap commits only if the stored version still equals `expected`.
    async fn compare_and_swap(
        &self,
        code: &RoomCode,
        expected: Option<u64>,
        next: Option<Room>,
    ) -> Result<CasOutcome, StoreError>;

    /// Codes of every live room.
    async fn list_codes(&self) -> Result<Vec<RoomCode>, StoreError>;

    /// Subscribe to committed changes from this point on.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

// =============================================================================
// TEST HELPERS
// =============================================================================
