// src/main.rs

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use market_chat::{
    ChatConfig, ChatService, ChatState,
    backbone::{KeyValueStore, MemoryBackbone, PubSub, RedisBackbone},
    routes,
    store::{ChatStore, PgChatStore},
};

/// The main entry point for our application.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Install the recorder before any component touches a counter.
    routes::metrics_handle();

    let config = ChatConfig::from_env().context("failed to load configuration")?;

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;
    let store = PgChatStore::connect(&database_url, config.database_max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store
        .setup_database()
        .await
        .context("failed to set up database schema")?;
    let store: Arc<dyn ChatStore> = Arc::new(store);

    let (kv, pubsub) = connect_backbone(config.redis_url.as_deref()).await;

    let addr = config.server_addr;
    let chat = ChatService::start(config, store, kv, pubsub);
    let state = ChatState::new(chat);
    let app = routes::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("WebSocket server listening on ws://{}/ws", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.chat.shutdown().await;
    info!("server stopped");
    Ok(())
}

/// Connects to Redis when configured. Without Redis the server still runs,
/// but presence, unread counts and the bus are local to this process.
async fn connect_backbone(redis_url: Option<&str>) -> (Arc<dyn KeyValueStore>, Arc<dyn PubSub>) {
    if let Some(url) = redis_url {
        match RedisBackbone::connect(url).await {
            Ok(redis) => {
                info!("connected to Redis");
                let redis = Arc::new(redis);
                return (redis.clone(), redis);
            }
            Err(e) => warn!(error = %e, "failed to connect to Redis, continuing without it"),
        }
    } else {
        warn!("REDIS_URL not set, running in single-process mode");
    }
    let memory = Arc::new(MemoryBackbone::new());
    (memory.clone(), memory)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
