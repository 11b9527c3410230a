//! Client session — one client's visit to one room.
//!
//! DESIGN
//! ======
//! A small state machine: `Idle → Joining → Active → Leaving → Idle`, with
//! `Failed` as the terminal outcome of a join the room refused. While
//! Active a heartbeat task refreshes the member's `last_seen_at` on an
//! interval well inside the staleness window, and prunes the room after
//! each beat so stale members disappear as long as anyone is connected.
//!
//! ERROR HANDLING
//! ==============
//! A beat that finds the slot gone (pruned after a long pause) rejoins. A
//! beat that finds the room gone fails the session. Transient store errors
//! are logged and the next beat tries again.
//!
//! The heartbeat is stopped cooperatively: a beat already talking to the
//! store finishes before `leave` reads the room, and a beat that sees the
//! stop signal does not rejoin. Aborting it instead could let a rejoin
//! commit after the leave and seat a ghost until pruning.
//!
//! Dropping an Active controller spawns a detached leave. That is only a
//! latency optimization: a killed process never runs it, and stale pruning
//! is what actually reclaims the slot.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ArenaConfig;
use crate::frame::ErrorCode;
use crate::services::room::{LeaveOutcome, RoomError, RoomManager};
use crate::state::{Admission, RoomCode};

// =============================================================================
// TYPES
// =============================================================================

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinFailure {
    RoomNotFound,
    RoomFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    Leaving,
    Failed(JoinFailure),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session cannot do that while {0:?}")]
    InvalidState(SessionState),
    #[error(transparent)]
    Room(#[from] RoomError),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "E_SESSION_STATE",
            Self::Room(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::InvalidState(_) => false,
            Self::Room(e) => e.retryable(),
        }
    }
}

/// Heartbeat cadence and the staleness window it must beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub heartbeat_interval: Duration,
    pub stale_threshold_ms: i64,
}

impl SessionTiming {
    #[must_use]
    pub fn from_config(config: &ArenaConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            stale_threshold_ms: config.stale_threshold_ms(),
        }
    }
}

/// Running heartbeat task and its stop signal.
struct Heartbeat {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Signal the task and wait for a beat in flight to finish.
    async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
    }
}

/// Who is visiting which room.
#[derive(Debug, Clone)]
struct Visit {
    room_code: RoomCode,
    user_id: String,
    display_name: String,
}

// =============================================================================
// CONTROLLER
// =============================================================================

pub struct SessionController {
    rooms: RoomManager,
    visit: Arc<Visit>,
    timing: SessionTiming,
    state: Arc<watch::Sender<SessionState>>,
    heartbeat: Option<Heartbeat>,
}

impl SessionController {
    #[must_use]
    pub fn new(
        rooms: RoomManager,
        room_code: RoomCode,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        timing: SessionTiming,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            rooms,
            visit: Arc::new(Visit { room_code, user_id: user_id.into(), display_name: display_name.into() }),
            timing,
            state: Arc::new(state),
            heartbeat: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions, including ones made by the heartbeat task.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn room_code(&self) -> &RoomCode {
        &self.visit.room_code
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.visit.user_id
    }

    /// Join the room and start heartbeating.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless Idle. A refused join moves the session to
    /// `Failed` and returns the room error; a store failure returns to Idle.
    pub async fn mount(&mut self) -> Result<Admission, SessionError> {
        let current = self.state();
        if current != SessionState::Idle {
            return Err(SessionError::InvalidState(current));
        }
        self.state.send_replace(SessionState::Joining);

        let visit = self.visit.clone();
        match self
            .rooms
            .join_room(&visit.room_code, &visit.user_id, &visit.display_name)
            .await
        {
            Ok(admission) => {
                self.state.send_replace(SessionState::Active);
                self.heartbeat = Some(self.spawn_heartbeat());
                info!(code = %visit.room_code, user_id = %visit.user_id, ?admission, "session active");
                Ok(admission)
            }
            Err(e) => {
                let next = join_failure(&e).map_or(SessionState::Idle, SessionState::Failed);
                self.state.send_replace(next);
                warn!(code = %visit.room_code, user_id = %visit.user_id, error = %e, "session join failed");
                Err(e.into())
            }
        }
    }

    /// Stop heartbeating and give up the slot. Ends Idle even if the store
    /// call fails; staleness pruning reclaims the slot in that case.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless Active, or the store error from `leave_room`.
    pub async fn leave(&mut self) -> Result<LeaveOutcome, SessionError> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        // The heartbeat task may have failed the session concurrently.
        let current = self.state();
        if current != SessionState::Active {
            return Err(SessionError::InvalidState(current));
        }
        self.state.send_replace(SessionState::Leaving);

        let result = self
            .rooms
            .leave_room(&self.visit.room_code, &self.visit.user_id)
            .await;
        self.state.send_replace(SessionState::Idle);
        debug!(code = %self.visit.room_code, user_id = %self.visit.user_id, "session left");
        Ok(result?)
    }

    /// Publish the typing flag to the room.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless Active, or the room error.
    pub async fn set_typing(&self, is_typing: bool) -> Result<(), SessionError> {
        let current = self.state();
        if current != SessionState::Active {
            return Err(SessionError::InvalidState(current));
        }
        self.rooms
            .set_typing(&self.visit.room_code, &self.visit.user_id, is_typing)
            .await?;
        Ok(())
    }

    fn spawn_heartbeat(&self) -> Heartbeat {
        let rooms = self.rooms.clone();
        let visit = self.visit.clone();
        let timing = self.timing;
        let state = self.state.clone();
        let (stop, mut stopping) = watch::channel(false);
        let task = tokio::spawn(async move {
            let period = timing.heartbeat_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    // A dropped sender stops the task too.
                    _ = stopping.changed() => break,
                }
                if let Some(failure) = beat(&rooms, &visit, timing, &stopping).await {
                    fail_if_active(&state, failure);
                    break;
                }
            }
        });
        Heartbeat { stop, task }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // Dropping a `Heartbeat` without awaiting it still signals the task.
        let heartbeat = self.heartbeat.take();
        if self.state() != SessionState::Active {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let rooms = self.rooms.clone();
        let visit = self.visit.clone();
        handle.spawn(async move {
            if let Some(heartbeat) = heartbeat {
                heartbeat.stop().await;
            }
            if let Err(e) = rooms.leave_room(&visit.room_code, &visit.user_id).await {
                warn!(code = %visit.room_code, user_id = %visit.user_id, error = %e, "teardown leave failed; pruning will reclaim");
            }
        });
    }
}

// =============================================================================
// HEARTBEAT
// =============================================================================

/// One heartbeat. Returns the failure that ends the session, if any.
async fn beat(
    rooms: &RoomManager,
    visit: &Visit,
    timing: SessionTiming,
    stopping: &watch::Receiver<bool>,
) -> Option<JoinFailure> {
    let code = &visit.room_code;
    match rooms.heartbeat(code, &visit.user_id).await {
        Ok(()) => {}
        Err(RoomError::NotMember { .. }) => {
            if *stopping.borrow() {
                return None;
            }
            info!(%code, user_id = %visit.user_id, "slot lost; rejoining");
            if let Err(e) = rooms.join_room(code, &visit.user_id, &visit.display_name).await {
                warn!(%code, user_id = %visit.user_id, error = %e, "rejoin failed");
                return join_failure(&e);
            }
        }
        Err(RoomError::RoomNotFound(_)) => {
            info!(%code, user_id = %visit.user_id, "room gone; ending session");
            return Some(JoinFailure::RoomNotFound);
        }
        Err(e) => {
            warn!(%code, user_id = %visit.user_id, error = %e, "heartbeat failed");
            return None;
        }
    }

    if let Err(e) = rooms.prune_stale(code, timing.stale_threshold_ms).await {
        warn!(%code, error = %e, "heartbeat prune failed");
    }
    None
}

fn fail_if_active(state: &watch::Sender<SessionState>, failure: JoinFailure) {
    state.send_if_modified(|current| {
        if *current == SessionState::Active {
            *current = SessionState::Failed(failure);
            true
        } else {
            false
        }
    });
}

fn join_failure(err: &RoomError) -> Option<JoinFailure> {
    match err {
        RoomError::RoomNotFound(_) => Some(JoinFailure::RoomNotFound),
        RoomError::RoomFull { .. } => Some(JoinFailure::RoomFull),
        _ => None,
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
