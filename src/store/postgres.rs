//! Postgres presence store — the multi-instance backend.
//!
//! DESIGN
//! ======
//! One row per room in `arena_rooms`, members as a JSONB document, and a
//! `version` drawn from the `arena_revision` sequence on every write. A swap
//! is a single conditional statement (`... WHERE version = $expected`) in a
//! transaction that also issues `pg_notify`, so the notification is sent if
//! and only if the write commits.
//!
//! Each instance runs one listener task that turns notifications back into
//! `RoomChange` events by re-reading the row. A notification payload is
//! `code:version`; when the row is gone the change is reported as a delete
//! at that version.
//!
//! Writers hold a per-code advisory lock from before they draw a version
//! until they commit. `observe` takes the same lock in shared mode, so the
//! sequence value it reads is a true watermark: no commit to that code at or
//! below it can still be in flight.
//!
//! ERROR HANDLING
//! ==============
//! If the listener connection drops, notifications sent in the gap are lost.
//! The listener publishes `StoreEvent::Resync` after reconnecting so every
//! observer re-reads its room.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{
    CHANGE_CHANNEL_CAPACITY, CasOutcome, Observed, PresenceStore, RoomChange, StoreError, StoreEvent, Versioned,
};
use crate::state::{Member, Room, RoomCode};

/// `LISTEN` channel for room commits.
pub const NOTIFY_CHANNEL: &str = "arena_rooms";

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

const SELECT_ROOM: &str = "SELECT code, version, created_at, created_by, capacity, active_member_count, members \
                           FROM arena_rooms WHERE code = $1";

type RoomRow = (String, i64, i64, String, i32, i32, Json<BTreeMap<String, Member>>);

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    changes: broadcast::Sender<StoreEvent>,
}

impl PgStore {
    /// Build the store and spawn its notification listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial `LISTEN` cannot be established.
    pub async fn connect(pool: PgPool) -> Result<(Self, JoinHandle<()>), StoreError> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self { pool, changes };

        let mut listener = PgListener::connect_with(&store.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        info!(channel = NOTIFY_CHANNEL, "presence listener subscribed");

        let worker = store.clone();
        let handle = tokio::spawn(async move { worker.run_listener(listener).await });
        Ok((store, handle))
    }

    async fn run_listener(self, mut listener: PgListener) {
        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    let Some((code, version)) = parse_payload(notification.payload()) else {
                        warn!(payload = notification.payload(), "ignoring malformed presence notification");
                        continue;
                    };
                    self.publish_current(code, version).await;
                }
                Ok(None) => {
                    // Connection was lost; `try_recv` reconnects on the next call.
                    warn!("presence listener connection lost; resyncing observers");
                    let _ = self.changes.send(StoreEvent::Resync);
                }
                Err(e) => {
                    warn!(error = %e, "presence listener failed; retrying");
                    tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    let _ = self.changes.send(StoreEvent::Resync);
                }
            }
        }
    }

    async fn publish_current(&self, code: RoomCode, notified_version: u64) {
        let change = match self.load(&code).await {
            Ok(Some(current)) => RoomChange { code, version: current.version, room: Some(current.value) },
            Ok(None) => RoomChange { code, version: notified_version, room: None },
            Err(e) => {
                warn!(error = %e, %code, "failed to read notified room; resyncing observers");
                let _ = self.changes.send(StoreEvent::Resync);
                return;
            }
        };
        let _ = self.changes.send(StoreEvent::Changed(change));
    }
}

#[async_trait]
impl PresenceStore for PgStore {
    async fn load(&self, code: &RoomCode) -> Result<Option<Versioned<Room>>, StoreError> {
        let row = sqlx::query_as::<_, RoomRow>(SELECT_ROOM)
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_room).transpose()
    }

    async fn observe(&self, code: &RoomCode) -> Result<Observed, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock_shared(hashtext($1))")
            .bind(code.as_str())
            .execute(tx.as_mut())
            .await?;
        let row = sqlx::query_as::<_, RoomRow>(SELECT_ROOM)
            .bind(code.as_str())
            .fetch_optional(tx.as_mut())
            .await?;
        let revision: i64 =
            sqlx::query_scalar("SELECT CASE WHEN is_called THEN last_value ELSE 0 END FROM arena_revision")
                .fetch_one(tx.as_mut())
                .await?;
        tx.commit().await?;

        Ok(Observed { room: row.map(row_to_room).transpose()?, revision: from_db_version(revision)? })
    }

    async fn compare_and_swap(
        &self,
        code: &RoomCode,
        expected: Option<u64>,
        next: Option<Room>,
    ) -> Result<CasOutcome, StoreError> {
        if expected.is_none() && next.is_none() {
            return Ok(CasOutcome::Conflict);
        }
        let expected = expected.map(to_db_version).transpose()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(code.as_str())
            .execute(tx.as_mut())
            .await?;

        let committed: Option<i64> = match (expected, &next) {
            (None, None) => None,
            (None, Some(room)) => {
                sqlx::query_scalar(
                    "INSERT INTO arena_rooms \
                         (code, version, created_at, created_by, capacity, active_member_count, members) \
                     VALUES ($1, nextval('arena_revision'), $2, $3, $4, $5, $6) \
                     ON CONFLICT (code) DO NOTHING \
                     RETURNING version",
                )
                .bind(code.as_str())
                .bind(room.created_at)
                .bind(&room.created_by)
                .bind(to_db_count(room.capacity)?)
                .bind(to_db_count(room.active_member_count)?)
                .bind(Json(&room.members))
                .fetch_optional(tx.as_mut())
                .await?
            }
            (Some(version), Some(room)) => {
                sqlx::query_scalar(
                    "UPDATE arena_rooms \
                     SET version = nextval('arena_revision'), capacity = $3, \
                         active_member_count = $4, members = $5 \
                     WHERE code = $1 AND version = $2 \
                     RETURNING version",
                )
                .bind(code.as_str())
                .bind(version)
                .bind(to_db_count(room.capacity)?)
                .bind(to_db_count(room.active_member_count)?)
                .bind(Json(&room.members))
                .fetch_optional(tx.as_mut())
                .await?
            }
            (Some(version), None) => {
                let deleted: Option<String> =
                    sqlx::query_scalar("DELETE FROM arena_rooms WHERE code = $1 AND version = $2 RETURNING code")
                        .bind(code.as_str())
                        .bind(version)
                        .fetch_optional(tx.as_mut())
                        .await?;
                match deleted {
                    Some(_) => Some(
                        sqlx::query_scalar("SELECT nextval('arena_revision')")
                            .fetch_one(tx.as_mut())
                            .await?,
                    ),
                    None => None,
                }
            }
        };

        let Some(version) = committed else {
            tx.rollback().await?;
            return Ok(CasOutcome::Conflict);
        };

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(format!("{code}:{version}"))
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;

        Ok(CasOutcome::Committed { version: from_db_version(version)? })
    }

    async fn list_codes(&self) -> Result<Vec<RoomCode>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT code FROM arena_rooms ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|raw| raw.parse().map_err(|e| StoreError::Corrupt(format!("{e}"))))
            .collect()
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.changes.subscribe()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_payload(payload: &str) -> Option<(RoomCode, u64)> {
    let (code, version) = payload.split_once(':')?;
    Some((code.parse().ok()?, version.parse().ok()?))
}

fn row_to_room(row: RoomRow) -> Result<Versioned<Room>, StoreError> {
    let (code, version, created_at, created_by, capacity, active_member_count, Json(members)) = row;
    let room_code: RoomCode = code.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))?;
    let room = Room {
        room_code,
        created_at,
        created_by,
        capacity: from_db_count(capacity)?,
        active_member_count: from_db_count(active_member_count)?,
        members,
    };
    Ok(Versioned { version: from_db_version(version)?, value: room })
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Corrupt(format!("version {version} out of range")))
}

fn from_db_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::Corrupt(format!("negative version {version}")))
}

fn to_db_count(n: u32) -> Result<i32, StoreError> {
    i32::try_from(n).map_err(|_| StoreError::Corrupt(format!("count {n} out of range")))
}

fn from_db_count(n: i32) -> Result<u32, StoreError> {
    u32::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative count {n}")))
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
