use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use mini_profiler::capture::{CaptureLayer, SinkRegistry};
use mini_profiler::{server, store, Profiler, ProfilerConfig};

mod demo;
mod redis_client;

const APP_REDIS_URL: &str = "redis://127.0.0.1:6379/";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── 1. Logging: console + per-request capture ────────────────
    let sinks = SinkRegistry::default();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,mini_profiler=debug")),
            ),
        )
        .with(CaptureLayer::new(sinks.clone()).with_filter(LevelFilter::DEBUG))
        .init();

    // ── 2. Profiler ──────────────────────────────────────────────
    let config = ProfilerConfig::from_env()?;
    tracing::info!(
        environment = ?config.environment,
        store = ?config.store,
        mode = %config.default_mode,
        "profiler configured"
    );
    let profile_store = store::connect(&config).await?;
    let profiler = Arc::new(
        Profiler::builder(config)
            .with_store(profile_store)
            .with_sinks(sinks)
            .build(),
    );

    // ── 3. Application ───────────────────────────────────────────
    let redis = redis_client::connect(APP_REDIS_URL).await?;
    demo::notes::seed(&redis).await?;
    let state = Arc::new(demo::AppState { redis });

    let app = server::install(demo::router(state), profiler).layer(CorsLayer::permissive());

    // ── 4. Bind & serve ──────────────────────────────────────────
    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("notes app      → http://localhost:3000/notes/latest");
    tracing::info!("profiler query → http://localhost:3000/mini_profiler/request?request_ids=");

    axum::serve(listener, app).await?;
    Ok(())
}
