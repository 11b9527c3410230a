//! Room REST routes.

use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::warn;

use crate::frame::ErrorCode;
use crate::services::room::{CreatedRoom, RoomError};
use crate::state::{AppState, InvalidRoomCode, Member, RoomCode};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

// =============================================================================
// CALLER EXTRACTOR
// =============================================================================

/// Identity forwarded by the gateway. Missing `x-user-id` rejects with 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    /// Raw name; the room service normalizes it.
    pub display_name: String,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .unwrap_or_default()
                .to_owned()
        };
        let user_id = header(USER_ID_HEADER);
        if user_id.is_empty() {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(Self { user_id, display_name: header(USER_NAME_HEADER) })
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub room_code: RoomCode,
    pub version: u64,
    pub capacity: u32,
    pub active_member_count: u32,
    pub created_at: i64,
    pub created_by: String,
    pub members: Vec<Member>,
}

/// Request failure rendered as status plus `{code, message, retryable}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    InvalidCode(#[from] InvalidRoomCode),
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Room(e) => e.error_code(),
            Self::InvalidCode(_) => "E_INVALID_ROOM_CODE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Room(e) => e.retryable(),
            Self::InvalidCode(_) => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Room(e) => room_error_to_status(e),
            // A malformed code can never name a live room.
            Self::InvalidCode(_) => StatusCode::NOT_FOUND,
        };
        if status.is_server_error() {
            warn!(error = %self, code = self.error_code(), "room request failed");
        }
        let body = serde_json::json!({
            "code": self.error_code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        (status, Json(body)).into_response()
    }
}

pub(crate) fn room_error_to_status(err: &RoomError) -> StatusCode {
    match err {
        RoomError::RoomNotFound(_) => StatusCode::NOT_FOUND,
        RoomError::RoomFull { .. } | RoomError::ConcurrentModification(_) => StatusCode::CONFLICT,
        RoomError::NotMember { .. } => StatusCode::FORBIDDEN,
        RoomError::CodeSpaceExhausted { .. } | RoomError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `POST /api/rooms` — create a room with the caller seated.
pub async fn create_room(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<(StatusCode, Json<CreatedRoom>), ApiError> {
    let created = state
        .rooms
        .create_room(&caller.user_id, &caller.display_name)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /api/rooms/{code}` — current membership.
pub async fn get_room(State(state): State<AppState>, Path(code): Path<String>) -> Result<Json<RoomResponse>, ApiError> {
    let code: RoomCode = code.parse()?;
    let current = state.rooms.snapshot(&code).await?;
    let room = current.value;
    Ok(Json(RoomResponse {
        members: room.member_list(),
        room_code: room.room_code,
        version: current.version,
        capacity: room.capacity,
        active_member_count: room.active_member_count,
        created_at: room.created_at,
        created_by: room.created_by,
    }))
}

/// `POST /api/rooms/{code}/join` — take or refresh a slot.
pub async fn join_room(
    State(state): State<AppState>,
    caller: Caller,
    Path(code): Path<String>,
) -> Result<StatusCode, ApiError> {
    let code: RoomCode = code.parse()?;
    state
        .rooms
        .join_room(&code, &caller.user_id, &caller.display_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/rooms/{code}/leave` — give up the slot. Idempotent.
pub async fn leave_room(
    State(state): State<AppState>,
    caller: Caller,
    Path(code): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Leaving a room that cannot exist is the same no-op as leaving a gone one.
    let Ok(code) = code.parse::<RoomCode>() else {
        return Ok(StatusCode::NO_CONTENT);
    };
    state.rooms.leave_room(&code, &caller.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
