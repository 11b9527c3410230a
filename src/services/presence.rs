//! Presence subscriptions — full-snapshot delivery of room membership.
//!
//! DESIGN
//! ======
//! Each subscription is one task reading the store's change stream and
//! filtering for its room. Observers always receive the complete member
//! list, never a diff, so a missed update heals on the next delivery.
//!
//! A snapshot is delivered only if its version is newer than the last one
//! delivered. Re-reads triggered by lag or resync can therefore never
//! reorder what a subscriber sees: within a room, deliveries follow commit
//! order. A re-read that finds the room gone carries the store revision it
//! was read at, so changes older than the deletion still queued behind it
//! are dropped rather than bringing the room back.
//!
//! A re-read that keeps failing is retried with backoff until it succeeds,
//! even if the room never changes again.
//!
//! CANCELLATION
//! ============
//! `Subscription::unsubscribe` clears the active flag and aborts the task.
//! The flag is checked immediately before every callback, so once
//! `unsubscribe` returns no new callback starts. Dropping the handle
//! unsubscribes too.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::state::{Member, RoomCode};
use crate::store::{PresenceStore, RoomChange, StoreEvent};

// =============================================================================
// TYPES
// =============================================================================

/// Full membership of one room at one committed version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub room_code: RoomCode,
    pub version: u64,
    /// `false` once the room has been deleted (or never existed).
    pub exists: bool,
    pub active_member_count: u32,
    /// Ordered by join time.
    pub members: Vec<Member>,
}

impl Snapshot {
    fn from_change(change: RoomChange) -> Self {
        match change.room {
            Some(room) => Self {
                room_code: change.code,
                version: change.version,
                exists: true,
                active_member_count: room.active_member_count,
                members: room.member_list(),
            },
            None => Self::gone(change.code, change.version),
        }
    }

    fn gone(room_code: RoomCode, version: u64) -> Self {
        Self { room_code, version, exists: false, active_member_count: 0, members: Vec::new() }
    }
}

type Callback = Box<dyn Fn(Snapshot) + Send + Sync>;

struct Shared {
    active: AtomicBool,
    on_change: Callback,
    live: Arc<AtomicUsize>,
}

impl Shared {
    fn deliver(&self, snapshot: Snapshot) {
        if self.active.load(Ordering::SeqCst) {
            (self.on_change)(snapshot);
        }
    }

    /// Returns true only for the call that actually deactivated.
    fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        was_active
    }
}

/// Handle for one registration. Unsubscribes on drop.
pub struct Subscription {
    room_code: RoomCode,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop deliveries. Idempotent; safe after the room is gone.
    pub fn unsubscribe(&self) {
        if self.shared.deactivate() {
            debug!(code = %self.room_code, "presence subscription cancelled");
        }
        self.task.abort();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// =============================================================================
// HUB
// =============================================================================

#[derive(Clone)]
pub struct PresenceHub {
    store: Arc<dyn PresenceStore>,
    live: Arc<AtomicUsize>,
}

impl PresenceHub {
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store, live: Arc::new(AtomicUsize::new(0)) }
    }

    /// Register `on_change` for every membership change of `code`.
    ///
    /// The current snapshot is delivered first; a room that does not exist
    /// yields one snapshot with `exists == false`. Must be called from
    /// within a tokio runtime.
    pub fn subscribe<F>(&self, code: RoomCode, on_change: F) -> Subscription
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        // Subscribe to the stream before the initial read so no commit
        // falls between the two.
        let events = self.store.watch();
        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            on_change: Box::new(on_change),
            live: self.live.clone(),
        });
        self.live.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(run_subscription(self.store.clone(), code.clone(), events, shared.clone()));
        debug!(%code, "presence subscription registered");
        Subscription { room_code: code, shared, task }
    }

    /// Number of subscriptions not yet cancelled.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

// =============================================================================
// DELIVERY LOOP
// =============================================================================

/// Re-read attempts per resync before backing off.
const RESYNC_ATTEMPTS: u32 = 3;
const RESYNC_RETRY_BASE: Duration = Duration::from_millis(50);
/// Delay before a failed resync is tried again.
const RESYNC_BACKOFF: Duration = Duration::from_secs(1);

/// Last delivered position for one subscriber.
#[derive(Debug, Default)]
struct Cursor {
    /// Highest version delivered or ruled out by a read.
    version: u64,
    /// An `exists == false` snapshot has been delivered since the last live one.
    gone_delivered: bool,
}

impl Cursor {
    /// Whether `snapshot` moves this subscriber forward.
    fn accept(&mut self, snapshot: &Snapshot) -> bool {
        if snapshot.exists {
            if snapshot.version <= self.version {
                return false;
            }
            self.version = snapshot.version;
            self.gone_delivered = false;
            return true;
        }
        // Version 0 is an absent read of a store that never committed.
        if snapshot.version != 0 && snapshot.version <= self.version {
            return false;
        }
        self.version = self.version.max(snapshot.version);
        !std::mem::replace(&mut self.gone_delivered, true)
    }
}

async fn run_subscription(
    store: Arc<dyn PresenceStore>,
    code: RoomCode,
    mut events: tokio::sync::broadcast::Receiver<StoreEvent>,
    shared: Arc<Shared>,
) {
    let mut cursor = Cursor::default();
    let mut retry_at = resync(store.as_ref(), &code, &shared, &mut cursor).await;

    loop {
        let received = match retry_at {
            Some(deadline) => tokio::select! {
                received = events.recv() => received,
                () = tokio::time::sleep_until(deadline) => {
                    retry_at = resync(store.as_ref(), &code, &shared, &mut cursor).await;
                    continue;
                }
            },
            None => events.recv().await,
        };
        match received {
            Ok(StoreEvent::Changed(change)) => {
                if change.code != code {
                    continue;
                }
                let snapshot = Snapshot::from_change(change);
                if cursor.accept(&snapshot) {
                    shared.deliver(snapshot);
                }
            }
            Ok(StoreEvent::Resync) => {
                retry_at = resync(store.as_ref(), &code, &shared, &mut cursor).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(%code, skipped, "presence subscriber lagged; re-reading room");
                retry_at = resync(store.as_ref(), &code, &shared, &mut cursor).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Read the room directly and deliver it if it is news.
///
/// An absent room is reported at the read's revision, which also discards
/// any older change still queued for this subscriber. Returns when to try
/// again if every attempt failed.
async fn resync(
    store: &dyn PresenceStore,
    code: &RoomCode,
    shared: &Shared,
    cursor: &mut Cursor,
) -> Option<Instant> {
    let mut attempt = 1;
    let observed = loop {
        match store.observe(code).await {
            Ok(observed) => break observed,
            Err(e) if attempt < RESYNC_ATTEMPTS => {
                warn!(error = %e, %code, attempt, "presence re-read failed; retrying");
                tokio::time::sleep(RESYNC_RETRY_BASE * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(error = %e, %code, attempts = attempt, "presence re-read failed; rescheduling");
                return Some(Instant::now() + RESYNC_BACKOFF);
            }
        }
    };

    let snapshot = match observed.room {
        Some(current) => Snapshot::from_change(RoomChange {
            code: code.clone(),
            version: current.version,
            room: Some(current.value),
        }),
        None => Snapshot::gone(code.clone(), observed.revision),
    };
    if cursor.accept(&snapshot) {
        shared.deliver(snapshot);
    }
    None
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
