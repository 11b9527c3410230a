//! Room data model and shared application state.
//!
//! DESIGN
//! ======
//! A `Room` is the unit of consistency. Its metadata, derived counter and
//! member map are stored and swapped as one document keyed by the room
//! code, so the counter and the member list can never be observed out of
//! sync. The transition methods on `Room` are pure; callers run them inside
//! an optimistic compare-and-swap loop against the presence store.
//!
//! `AppState` is injected into Axum handlers via the `State` extractor.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ArenaConfig;
use crate::services::presence::PresenceHub;
use crate::services::room::RoomManager;
use crate::store::PresenceStore;

/// Maximum concurrent members of a room.
pub const DEFAULT_ROOM_CAPACITY: u32 = 5;

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// ROOM CODE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("room code must be {len} ascii digits, got {raw:?}", len = RoomCode::LEN)]
pub struct InvalidRoomCode {
    pub raw: String,
}

/// Shareable six-digit room code. Doubles as the room's storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    pub const LEN: usize = 6;

    /// Draw a fresh candidate code. Uniqueness is checked by the store.
    #[must_use]
    pub fn generate() -> Self {
        let n: u32 = rand::rng().random_range(100_000..=999_999);
        Self(n.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomCode {
    type Err = InvalidRoomCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() == Self::LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(trimmed.to_owned()))
        } else {
            Err(InvalidRoomCode { raw: s.to_owned() })
        }
    }
}

impl TryFrom<String> for RoomCode {
    type Error = InvalidRoomCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// MEMBER
// =============================================================================

/// A user's live presence record within a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub display_name: String,
    /// Milliseconds since Unix epoch.
    pub joined_at: i64,
    /// Milliseconds since Unix epoch. Refreshed by heartbeats and rejoins.
    pub last_seen_at: i64,
    pub is_typing: bool,
}

impl Member {
    #[must_use]
    pub fn is_stale(&self, now: i64, threshold_ms: i64) -> bool {
        now.saturating_sub(self.last_seen_at) > threshold_ms
    }
}

// =============================================================================
// ROOM
// =============================================================================

/// Result of admitting a user into a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// A new member slot was taken.
    Joined,
    /// The user already held a slot; only `last_seen_at` moved.
    Rejoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room is at capacity ({capacity})")]
pub struct AtCapacity {
    pub capacity: u32,
}

/// One collaborative session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_code: RoomCode,
    pub created_at: i64,
    pub created_by: String,
    pub capacity: u32,
    /// Always equals `members.len()`.
    pub active_member_count: u32,
    /// Members keyed by user ID.
    pub members: BTreeMap<String, Member>,
}

impl Room {
    /// A fresh room holding only its creator.
    #[must_use]
    pub fn new(room_code: RoomCode, creator_id: &str, creator_name: &str, capacity: u32, now: i64) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            creator_id.to_owned(),
            Member {
                user_id: creator_id.to_owned(),
                display_name: creator_name.to_owned(),
                joined_at: now,
                last_seen_at: now,
                is_typing: false,
            },
        );
        Self { room_code, created_at: now, created_by: creator_id.to_owned(), capacity, active_member_count: 1, members }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    /// Counter and member map agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        usize::try_from(self.active_member_count).is_ok_and(|n| n == self.members.len())
    }

    /// Take a member slot, or refresh the existing one.
    ///
    /// Rejoining never consults capacity and never moves the counter.
    ///
    /// # Errors
    ///
    /// Returns `AtCapacity` when a new slot would exceed `capacity`.
    pub fn admit(&mut self, user_id: &str, display_name: &str, now: i64) -> Result<Admission, AtCapacity> {
        if let Some(member) = self.members.get_mut(user_id) {
            member.last_seen_at = member.last_seen_at.max(now);
            return Ok(Admission::Rejoined);
        }

        if self.active_member_count >= self.capacity {
            return Err(AtCapacity { capacity: self.capacity });
        }

        self.members.insert(
            user_id.to_owned(),
            Member {
                user_id: user_id.to_owned(),
                display_name: display_name.to_owned(),
                joined_at: now,
                last_seen_at: now,
                is_typing: false,
            },
        );
        self.active_member_count += 1;
        Ok(Admission::Joined)
    }

    /// Drop a member slot. Returns false if the user held none.
    pub fn remove(&mut self, user_id: &str) -> bool {
        if self.members.remove(user_id).is_none() {
            return false;
        }
        self.active_member_count = self.active_member_count.saturating_sub(1);
        true
    }

    /// Refresh `last_seen_at`. Returns false if the user held no slot.
    pub fn touch(&mut self, user_id: &str, now: i64) -> bool {
        let Some(member) = self.members.get_mut(user_id) else {
            return false;
        };
        member.last_seen_at = member.last_seen_at.max(now);
        true
    }

    /// Set the typing flag. `None` if not a member, `Some(changed)` otherwise.
    pub fn set_typing(&mut self, user_id: &str, is_typing: bool) -> Option<bool> {
        let member = self.members.get_mut(user_id)?;
        let changed = member.is_typing != is_typing;
        member.is_typing = is_typing;
        Some(changed)
    }

    /// Remove every member silent for longer than `threshold_ms`.
    /// Returns the removed user IDs.
    pub fn prune_stale(&mut self, now: i64, threshold_ms: i64) -> Vec<String> {
        let stale: Vec<String> = self
            .members
            .values()
            .filter(|m| m.is_stale(now, threshold_ms))
            .map(|m| m.user_id.clone())
            .collect();
        for user_id in &stale {
            self.remove(user_id);
        }
        stale
    }

    /// Members ordered by join time, then user ID.
    #[must_use]
    pub fn member_list(&self) -> Vec<Member> {
        let mut list: Vec<Member> = self.members.values().cloned().collect();
        list.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user_id.cmp(&b.user_id)));
        list
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomManager,
    pub presence: PresenceHub,
    pub config: Arc<ArenaConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, config: ArenaConfig) -> Self {
        let rooms = RoomManager::new(store.clone(), config.room_policy());
        let presence = PresenceHub::new(store);
        Self { rooms, presence, config: Arc::new(config) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
