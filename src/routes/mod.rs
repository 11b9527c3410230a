//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the REST room endpoints and the websocket endpoint under one Axum
//! router. Identity is trusted from the caller: an upstream gateway is
//! expected to authenticate and forward `x-user-id` / `x-user-name`.

pub mod rooms;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/rooms", post(rooms::create_room))
        .route("/api/rooms/{code}", get(rooms::get_room))
        .route("/api/rooms/{code}/join", post(rooms::join_room))
        .route("/api/rooms/{code}/leave", post(rooms::leave_room))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::net::SocketAddr;

    use super::*;

    /// Serve `app(state)` on an ephemeral local port.
    pub async fn spawn_server(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app(state)).await;
        });
        addr
    }
}
