use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, Router};
use cove_signal::{Clock, MemoryStore, SignalStore, StoreRelay, SystemClock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, StoreBackend};
use crate::handlers::{fetch_signals, health_check, publish_signal, room_exists, SharedRelay};
use crate::storage::RedisStore;

pub fn router(relay: SharedRelay) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/webrtc/signal", get(fetch_signals).post(publish_signal))
        .route("/api/room/exists", get(room_exists))
        .with_state(relay)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Builds the relay for `config`. The memory backend has no room service
/// writing `room:` keys, so it always runs with open rooms.
pub async fn build_relay(config: &Config) -> Result<SharedRelay> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let open_rooms = match config.store_backend {
        StoreBackend::Redis => config.open_rooms,
        StoreBackend::Memory => {
            if !config.open_rooms {
                warn!("memory backend has no room registry; accepting every room code");
            }
            true
        }
    };
    let store: Arc<dyn SignalStore> = match config.store_backend {
        StoreBackend::Redis => {
            info!(redis_url = %config.redis_url, "connecting to redis");
            Arc::new(RedisStore::connect(&config.redis_url).await?)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new(clock.clone())),
    };
    let relay: SharedRelay = Arc::new(
        StoreRelay::new(store, clock)
            .with_ttl(config.ttl)
            .with_open_rooms(open_rooms),
    );
    Ok(relay)
}

pub async fn serve(config: Config) -> Result<()> {
    let relay = build_relay(&config).await?;
    let app = router(relay);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!(
        addr = %config.addr,
        backend = ?config.store_backend,
        candidate_ttl = ?config.ttl.candidate,
        description_ttl = ?config.ttl.description,
        presence_ttl = ?config.ttl.presence,
        "cove relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("cove relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
