//! mesh-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the shared
//! state, wires middleware, and starts the HTTP server. All route handlers
//! live in `routes.rs`; all shared state types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use mesh_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = mesh_config::CoreConfig::default().with_env_overrides();

    let shared = if std::env::var(mesh_bus::ENV_DB_URL).is_ok() {
        let pool = mesh_bus::relational::connect_from_env().await?;
        mesh_bus::relational::migrate(&pool).await?;
        let bus: Arc<dyn mesh_bus::IngestBus> = Arc::new(mesh_bus::RelationalBus::new(
            pool,
            cfg.max_attempts,
            cfg.max_batch_bytes,
        ));
        state::AppState::with_backends(
            cfg.clone(),
            bus,
            Arc::new(mesh_engine::MemoryEngine::new()),
        )
    } else {
        state::AppState::new_in_memory(cfg.clone())
    };

    // Pick up tenants that already had backlog before this boot.
    shared.pool.attach_backlogged().await?;
    shared.pool.spawn_reaper(Duration::from_secs(cfg.lease_seconds.max(1)));

    state::spawn_heartbeat(shared.events.clone(), Duration::from_secs(1));
    state::spawn_watermark_feed(Arc::clone(&shared), Duration::from_millis(500));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8979)));
    info!("mesh-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("MESH_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
