use std::sync::Arc;

use study_arena::config::ArenaConfig;
use study_arena::store::PresenceStore;
use study_arena::store::memory::MemoryStore;
use study_arena::store::postgres::PgStore;
use study_arena::{db, routes, services, state};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = ArenaConfig::from_env();

    // Keep the listener task alive for the life of the process.
    let (store, _listener): (Arc<dyn PresenceStore>, _) = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            let (store, listener) = PgStore::connect(pool)
                .await
                .expect("presence listener init failed");
            tracing::info!("using postgres presence store");
            let store: Arc<dyn PresenceStore> = Arc::new(store);
            (store, Some(listener))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory presence store (single node only)");
            let store: Arc<dyn PresenceStore> = Arc::new(MemoryStore::new());
            (store, None)
        }
    };

    let state = state::AppState::new(store, config.clone());

    let _sweeper = services::sweeper::spawn_sweeper(
        state.rooms.clone(),
        config.sweep_interval,
        config.stale_threshold_ms(),
    );

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, capacity = config.room_capacity, "study arena listening");
    axum::serve(listener, app).await.expect("server failed");
}
