//! Room service — create, join, leave, heartbeat, typing, and stale pruning.
//!
//! DESIGN
//! ======
//! Every mutation is an optimistic transaction over one room document:
//! load the versioned room, apply a pure transition, and compare-and-swap
//! it back. A conflict re-runs the transition against the fresh document,
//! up to `cas_retries` times. Because the counter and the member map live
//! in the same document they commit together or not at all.
//!
//! Teardown rides the same swap: a transition that leaves the room empty
//! commits a delete against the version it read. Two concurrent "last
//! leavers" cannot both delete, and the loser re-reads an absent room, so a
//! stale write never resurrects it.
//!
//! ERROR HANDLING
//! ==============
//! `RoomNotFound` and `RoomFull` are terminal and returned as-is. Transient
//! store failures are retried with linear backoff up to `store_retries`;
//! exhaustion is surfaced as `RoomError::Store`, never swallowed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::state::{Admission, Room, RoomCode, now_ms};
use crate::store::{CasOutcome, PresenceStore, StoreError, Versioned};

/// Name shown for members who supplied none.
pub const ANONYMOUS_NAME: &str = "Anonymous";
const MAX_DISPLAY_NAME_CHARS: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("room not found: {0}, check your room code")]
    RoomNotFound(RoomCode),
    #[error("room {code} is full ({capacity} members), try another")]
    RoomFull { code: RoomCode, capacity: u32 },
    #[error("user {user_id} is not a member of room {code}")]
    NotMember { code: RoomCode, user_id: String },
    #[error("room {0} kept changing under concurrent writers")]
    ConcurrentModification(RoomCode),
    #[error("no free room code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },
    #[error("presence store error: {0}")]
    Store(#[from] StoreError),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::RoomFull { .. } => "E_ROOM_FULL",
            Self::NotMember { .. } => "E_NOT_MEMBER",
            Self::ConcurrentModification(_) => "E_CONFLICT",
            Self::CodeSpaceExhausted { .. } => "E_CODE_EXHAUSTED",
            Self::Store(_) => "E_STORE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::ConcurrentModification(_) => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Limits applied by the room service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomPolicy {
    pub capacity: u32,
    pub cas_retries: u32,
    pub store_retries: u32,
    pub store_retry_base: Duration,
    pub code_attempts: u32,
}

/// Identifiers handed back by `create_room`. Both carry the same code: the
/// shareable code is also the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedRoom {
    pub room_id: RoomCode,
    pub room_code: RoomCode,
}

/// What `leave_room` actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeaveOutcome {
    /// The user held a slot and it was removed.
    pub removed: bool,
    /// The room became empty and was deleted by this call.
    pub room_deleted: bool,
}

/// What `prune_stale` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneOutcome {
    pub pruned: Vec<String>,
    pub room_deleted: bool,
}

/// Result of one transition against the current document.
enum Step<T> {
    Write(Room, T),
    Delete(T),
    /// Nothing to commit.
    Skip(T),
}

// =============================================================================
// ROOM MANAGER
// =============================================================================

#[derive(Clone)]
pub struct RoomManager {
    store: Arc<dyn PresenceStore>,
    policy: RoomPolicy,
}

impl RoomManager {
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, policy: RoomPolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub fn policy(&self) -> RoomPolicy {
        self.policy
    }

    /// Create a room under a fresh code with the creator as sole member.
    ///
    /// # Errors
    ///
    /// `CodeSpaceExhausted` after `code_attempts` collisions, or a store error.
    pub async fn create_room(&self, creator_id: &str, creator_name: &str) -> Result<CreatedRoom, RoomError> {
        self.create_room_at(creator_id, creator_name, now_ms()).await
    }

    pub async fn create_room_at(
        &self,
        creator_id: &str,
        creator_name: &str,
        now: i64,
    ) -> Result<CreatedRoom, RoomError> {
        let creator_name = normalize_display_name(creator_name);
        for attempt in 1..=self.policy.code_attempts {
            let code = RoomCode::generate();
            let room = Room::new(code.clone(), creator_id, &creator_name, self.policy.capacity, now);
            if self.insert_room(&code, room).await? {
                info!(%code, creator = creator_id, attempt, "room created");
                return Ok(CreatedRoom { room_id: code.clone(), room_code: code });
            }
            debug!(%code, attempt, "room code collision; drawing another");
        }
        Err(RoomError::CodeSpaceExhausted { attempts: self.policy.code_attempts })
    }

    /// Join a room, or refresh the caller's existing slot.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` if the code is not live, `RoomFull` if every slot is
    /// taken. Neither mutates the room.
    pub async fn join_room(&self, code: &RoomCode, user_id: &str, display_name: &str) -> Result<Admission, RoomError> {
        self.join_room_at(code, user_id, display_name, now_ms()).await
    }

    pub async fn join_room_at(
        &self,
        code: &RoomCode,
        user_id: &str,
        display_name: &str,
        now: i64,
    ) -> Result<Admission, RoomError> {
        let display_name = normalize_display_name(display_name);
        let admission = self
            .transact(code, |mut room| match room.admit(user_id, &display_name, now) {
                Ok(admission) => Ok(Step::Write(room, admission)),
                Err(full) => Err(RoomError::RoomFull { code: code.clone(), capacity: full.capacity }),
            })
            .await?;
        match admission {
            Admission::Joined => info!(%code, user_id, "member joined"),
            Admission::Rejoined => debug!(%code, user_id, "member rejoined"),
        }
        Ok(admission)
    }

    /// Remove the caller's slot, deleting the room if it empties.
    ///
    /// Leaving a room you are not in, or one that no longer exists, is a
    /// no-op: explicit leave and stale pruning converge on the same state.
    ///
    /// # Errors
    ///
    /// Store errors only.
    pub async fn leave_room(&self, code: &RoomCode, user_id: &str) -> Result<LeaveOutcome, RoomError> {
        let result = self
            .transact(code, |mut room| {
                if !room.remove(user_id) {
                    return Ok(Step::Skip(LeaveOutcome::default()));
                }
                if room.is_empty() {
                    Ok(Step::Delete(LeaveOutcome { removed: true, room_deleted: true }))
                } else {
                    Ok(Step::Write(room, LeaveOutcome { removed: true, room_deleted: false }))
                }
            })
            .await;

        let outcome = match result {
            Err(RoomError::RoomNotFound(_)) => LeaveOutcome::default(),
            other => other?,
        };
        if outcome.removed {
            info!(%code, user_id, "member left");
        }
        if outcome.room_deleted {
            info!(%code, "room empty; deleted");
        }
        Ok(outcome)
    }

    /// Remove members whose last heartbeat is older than `threshold_ms`,
    /// deleting the room if it empties.
    ///
    /// # Errors
    ///
    /// Store errors only; a missing room prunes nothing.
    pub async fn prune_stale(&self, code: &RoomCode, threshold_ms: i64) -> Result<PruneOutcome, RoomError> {
        self.prune_stale_at(code, threshold_ms, now_ms()).await
    }

    pub async fn prune_stale_at(&self, code: &RoomCode, threshold_ms: i64, now: i64) -> Result<PruneOutcome, RoomError> {
        let result = self
            .transact(code, |mut room| {
                let pruned = room.prune_stale(now, threshold_ms);
                if pruned.is_empty() {
                    return Ok(Step::Skip(PruneOutcome::default()));
                }
                if room.is_empty() {
                    Ok(Step::Delete(PruneOutcome { pruned, room_deleted: true }))
                } else {
                    Ok(Step::Write(room, PruneOutcome { pruned, room_deleted: false }))
                }
            })
            .await;

        let outcome = match result {
            Err(RoomError::RoomNotFound(_)) => PruneOutcome::default(),
            other => other?,
        };
        if !outcome.pruned.is_empty() {
            info!(%code, pruned = ?outcome.pruned, room_deleted = outcome.room_deleted, "pruned stale members");
        }
        Ok(outcome)
    }

    /// Refresh the caller's `last_seen_at`.
    ///
    /// # Errors
    ///
    /// `RoomNotFound`, or `NotMember` when the slot was pruned and the
    /// client must rejoin.
    pub async fn heartbeat(&self, code: &RoomCode, user_id: &str) -> Result<(), RoomError> {
        self.heartbeat_at(code, user_id, now_ms()).await
    }

    pub async fn heartbeat_at(&self, code: &RoomCode, user_id: &str, now: i64) -> Result<(), RoomError> {
        self.transact(code, |mut room| {
            if room.touch(user_id, now) {
                Ok(Step::Write(room, ()))
            } else {
                Err(RoomError::NotMember { code: code.clone(), user_id: user_id.to_owned() })
            }
        })
        .await
    }

    /// Set the caller's typing flag. Observers see it on the next snapshot.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` or `NotMember`.
    pub async fn set_typing(&self, code: &RoomCode, user_id: &str, is_typing: bool) -> Result<(), RoomError> {
        self.transact(code, |mut room| match room.set_typing(user_id, is_typing) {
            Some(true) => Ok(Step::Write(room, ())),
            Some(false) => Ok(Step::Skip(())),
            None => Err(RoomError::NotMember { code: code.clone(), user_id: user_id.to_owned() }),
        })
        .await
    }

    /// Current room document.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` or a store error.
    pub async fn snapshot(&self, code: &RoomCode) -> Result<Versioned<Room>, RoomError> {
        self.with_store_retry("load", || self.store.load(code))
            .await?
            .ok_or_else(|| RoomError::RoomNotFound(code.clone()))
    }

    /// Codes of every live room.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn live_rooms(&self) -> Result<Vec<RoomCode>, RoomError> {
        Ok(self.with_store_retry("list", || self.store.list_codes()).await?)
    }

    // =========================================================================
    // TRANSACTION CORE
    // =========================================================================

    /// Run `apply` against the current document until its result commits.
    async fn transact<T, F>(&self, code: &RoomCode, mut apply: F) -> Result<T, RoomError>
    where
        F: FnMut(Room) -> Result<Step<T>, RoomError>,
    {
        for attempt in 1..=self.policy.cas_retries {
            let Some(current) = self.with_store_retry("load", || self.store.load(code)).await? else {
                return Err(RoomError::RoomNotFound(code.clone()));
            };

            let (next, out) = match apply(current.value)? {
                Step::Write(room, out) => {
                    debug_assert!(room.is_consistent(), "member counter out of sync");
                    (Some(room), out)
                }
                Step::Delete(out) => (None, out),
                Step::Skip(out) => return Ok(out),
            };

            let outcome = self
                .with_store_retry("compare_and_swap", || {
                    self.store
                        .compare_and_swap(code, Some(current.version), next.clone())
                })
                .await?;
            match outcome {
                CasOutcome::Committed { version } => {
                    debug!(%code, version, attempt, "room write committed");
                    return Ok(out);
                }
                CasOutcome::Conflict => debug!(%code, attempt, "room write conflicted; re-reading"),
            }
        }

        warn!(%code, retries = self.policy.cas_retries, "room write kept conflicting");
        Err(RoomError::ConcurrentModification(code.clone()))
    }

    /// Insert a brand-new room. `Ok(false)` means the code is taken.
    async fn insert_room(&self, code: &RoomCode, room: Room) -> Result<bool, RoomError> {
        let outcome = self
            .with_store_retry("insert", || self.store.compare_and_swap(code, None, Some(room.clone())))
            .await?;
        if let CasOutcome::Committed { .. } = outcome {
            return Ok(true);
        }

        // EDGE: an insert retried after a lost reply conflicts with itself.
        let existing = self.with_store_retry("load", || self.store.load(code)).await?;
        Ok(existing.is_some_and(|v| v.value == room))
    }

    async fn with_store_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.store_retries => {
                    warn!(error = %e, op, attempt, total = self.policy.store_retries, "presence store call failed; retrying");
                    tokio::time::sleep(self.policy.store_retry_base * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Trim, cap length, and fall back to `ANONYMOUS_NAME` when blank.
#[must_use]
pub fn normalize_display_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ANONYMOUS_NAME.to_owned();
    }
    trimmed.chars().take(MAX_DISPLAY_NAME_CHARS).collect()
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
