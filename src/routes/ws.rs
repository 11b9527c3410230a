//! WebSocket handler — one session controller per connection.
//!
//! DESIGN
//! ======
//! On upgrade the connection mounts a `SessionController` for the requested
//! room, subscribes to its presence, and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall
//! - Presence snapshots → push as `room:members` item frames
//! - Session state → a heartbeat that finds the room gone ends the socket
//!
//! Snapshots pass through a `watch` channel, so a slow client skips straight
//! to the newest membership instead of queueing every intermediate one.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → mount → `room:join` done (or error frame and close)
//! 2. Presence pushes `room:members` with the full member list
//! 3. Client sends `room:typing` / `room:leave`
//! 4. Close → unsubscribe → leave (best-effort; staleness covers the rest)

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::frame::{Data, Frame, Status};
use crate::services::presence::Snapshot;
use crate::services::session::{SessionController, SessionState, SessionTiming};
use crate::state::{AppState, RoomCode};

pub const SYSCALL_JOIN: &str = "room:join";
pub const SYSCALL_MEMBERS: &str = "room:members";
pub const SYSCALL_TYPING: &str = "room:typing";
pub const SYSCALL_LEAVE: &str = "room:leave";
pub const SYSCALL_SESSION: &str = "room:session";

// =============================================================================
// UPGRADE
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub room: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = params.user_id.trim().to_owned();
    if user_id.is_empty() {
        return (StatusCode::UNAUTHORIZED, "user_id required").into_response();
    }
    let code: RoomCode = match params.room.parse() {
        Ok(code) => code,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    let timing = SessionTiming::from_config(&state.config);
    let session = SessionController::new(state.rooms.clone(), code, user_id, params.name, timing);
    ws.on_upgrade(move |socket| run_ws(socket, state, session))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, mut session: SessionController) {
    let code = session.room_code().clone();
    let user_id = session.user_id().to_owned();

    let join_req = Frame::request(SYSCALL_JOIN, Data::new()).with_room(code.as_str());
    match session.mount().await {
        Ok(admission) => {
            let done = join_req.done().with_data("admission", serde_json::json!(admission));
            if send_frame(&mut socket, &done).await.is_err() {
                return;
            }
        }
        Err(e) => {
            let _ = send_frame(&mut socket, &join_req.error_from(&e)).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }
    info!(%code, %user_id, "ws: session connected");

    let (snapshot_tx, mut snapshot_rx) = watch::channel::<Option<Snapshot>>(None);
    let subscription = state.presence.subscribe(code.clone(), move |snapshot| {
        snapshot_tx.send_replace(Some(snapshot));
    });
    let mut session_state = session.watch_state();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let (replies, close) = process_inbound_text(&mut session, &text).await;
                        for frame in &replies {
                            let _ = send_frame(&mut socket, frame).await;
                        }
                        if close {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = snapshot_rx.borrow_and_update().as_ref().map(members_frame);
                if let Some(frame) = frame {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            }
            changed = session_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *session_state.borrow_and_update();
                if let SessionState::Failed(reason) = current {
                    let ended = Frame::push(SYSCALL_SESSION, Data::new())
                        .with_room(code.as_str())
                        .with_data("state", serde_json::json!(current))
                        .with_data("reason", serde_json::json!(reason));
                    let _ = send_frame(&mut socket, &Frame { status: Status::Error, ..ended }).await;
                    break;
                }
            }
        }
    }

    subscription.unsubscribe();
    if session.state() == SessionState::Active {
        if let Err(e) = session.leave().await {
            warn!(%code, %user_id, error = %e, "ws: leave on close failed; pruning will reclaim");
        }
    }
    let _ = socket.send(Message::Close(None)).await;
    info!(%code, %user_id, "ws: session disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame. Returns frames for the sender
/// and whether the connection should close.
async fn process_inbound_text(session: &mut SessionController, text: &str) -> (Vec<Frame>, bool) {
    let req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(code = %session.room_code(), error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return (vec![Frame { status: Status::Error, ..err }], false);
        }
    };
    let req = req.with_room(session.room_code().as_str());

    match req.syscall.as_str() {
        SYSCALL_TYPING => {
            let Some(typing) = req.bool_field("typing") else {
                return (vec![req.error("typing must be a boolean")], false);
            };
            match session.set_typing(typing).await {
                Ok(()) => (vec![req.done()], false),
                Err(e) => (vec![req.error_from(&e)], false),
            }
        }
        SYSCALL_LEAVE => match session.leave().await {
            Ok(outcome) => {
                let done = req
                    .done()
                    .with_data("removed", outcome.removed)
                    .with_data("room_deleted", outcome.room_deleted);
                (vec![done], true)
            }
            Err(e) => (vec![req.error_from(&e)], true),
        },
        other => {
            let msg = format!("unknown syscall: {other}");
            (vec![req.error(msg)], false)
        }
    }
}

/// Presence snapshot as a server-pushed item frame.
fn members_frame(snapshot: &Snapshot) -> Frame {
    Frame::push(SYSCALL_MEMBERS, Data::new())
        .with_room(snapshot.room_code.as_str())
        .with_data("version", snapshot.version)
        .with_data("exists", snapshot.exists)
        .with_data("active_member_count", snapshot.active_member_count)
        .with_data("members", serde_json::json!(snapshot.members))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if frame.status.is_terminal() {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    } else {
        // Membership pushes are frequent; keep them out of debug output.
        trace!(id = %frame.id, syscall = %frame.syscall, "ws: send push");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
