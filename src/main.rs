//! PromptPay payment-bridge HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server that exposes the bridge's
//! tool surface (`scan_promptpay_qr`, `get_crypto_quote`, `confirm_payment`,
//! `check_payment_status`, `get_exchange_rates`) plus a force-sync endpoint.
//!
//! Endpoints:
//! - `GET /` – greeting
//! - `GET /health` – liveness + network-quality snapshot
//! - `POST /tools/*` – tool surface (§6)
//! - `POST /sync/force` – drains the offline queue immediately
//!
//! This server includes:
//! - OpenTelemetry tracing, gated on `OTEL_EXPORTER_OTLP_*` being set
//! - per-request tracing spans via `TraceLayer`
//! - CORS support for cross-origin clients
//! - a background queue-processor ticker and network-quality prober
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `CONFIG` points at a JSON config file (default `config.json`)
//! - `OTEL_*` variables enable tracing export

mod capabilities;
mod config;
mod context;
mod eip712;
mod error;
mod handlers;
mod network;
mod order;
mod qr;
mod queue;
mod quote;
mod storage;
mod sync;
mod timestamp;
mod tools;
mod types;
mod util;

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::context::Context;
use crate::util::{SigDown, Telemetry};

/// Initializes the PromptPay bridge server.
///
/// - Loads `.env` variables.
/// - Initializes OpenTelemetry tracing (no-op unless `OTEL_*` is set).
/// - Opens the WAL-mode SQLite store, creating tables on first run.
/// - Spawns the queue-processor ticker and network-quality prober.
/// - Starts an Axum HTTP server exposing the tool surface.
///
/// Binds to the address specified by the `HOST` and `PORT` env vars (or the
/// loaded config file).
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _telemetry = Telemetry::new();

    let config = Config::load()?;
    let addr = SocketAddr::new(config.host(), config.port());

    let ctx = Arc::new(Context::bootstrap(config).await?);

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();
    ctx.spawn_background_tasks(cancel.clone());

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(ctx))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        std::process::exit(1);
    });

    let axum_graceful_shutdown = async move { cancel.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
