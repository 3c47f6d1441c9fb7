mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use murmur_api::AppStateInner;
use murmur_hub::Hub;
use murmur_store::{MemoryStore, MessageCache, RoomStore, SqliteStore, cleanup};

use crate::config::{Backend, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Stores. A database that cannot be opened is fatal.
    let memory = Arc::new(MemoryStore::new());
    let sqlite = if config.uses_sqlite() {
        let db = SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?;
        Some(Arc::new(db))
    } else {
        None
    };

    let room_store: Arc<dyn RoomStore> = match &sqlite {
        Some(db) if config.room_store == Backend::Sqlite => db.clone(),
        _ => memory.clone(),
    };
    let message_cache: Arc<dyn MessageCache> = match &sqlite {
        Some(db) if config.message_store == Backend::Sqlite => db.clone(),
        _ => memory.clone(),
    };
    info!(
        "Room store: {:?}, message store: {:?}",
        config.room_store, config.message_store
    );

    // Background maintenance
    tokio::spawn(cleanup::run_cleanup_loop(room_store.clone(), config.cleanup_interval));

    let hub = Hub::new(room_store, message_cache, config.hub_config());
    tokio::spawn(evict_expired_rooms(hub.clone(), config.cleanup_interval));

    let state = Arc::new(AppStateInner {
        hub: hub.clone(),
        session_cookie: config.session_cookie.clone(),
    });

    let app = murmur_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Murmur listening on {}", addr);
    info!("Rooms expire after {}s of inactivity", config.room_age.as_secs());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    Ok(())
}

/// Drop cached rooms whose record expired while nobody was looking.
async fn evict_expired_rooms(hub: Hub, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        match hub.evict_expired().await {
            Ok(0) => {}
            Ok(count) => info!("Evicted {} expired rooms", count),
            Err(e) => warn!("Room eviction error: {}", e),
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM, after telling every connected peer the rooms
/// are going away.
async fn shutdown_signal(hub: Hub) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    hub.shutdown().await;
}
