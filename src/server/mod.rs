//! HTTP service.
//!
//! Serves `/healthz`, `/prices` and, when telemetry is enabled, `/metrics`.
//! The price table is read through the oracle's lock; the voting loop is
//! never blocked by readers.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::config::{parse_duration, ServerConfig};
use crate::oracle::Oracle;
use crate::telemetry::Telemetry;

const STATUS_AVAILABLE: &str = "available";

#[derive(Clone)]
struct AppState {
    oracle: Arc<Oracle>,
    telemetry: Arc<Telemetry>,
}

/// Serve until cancellation. In-flight requests finish before shutdown.
pub async fn serve(
    cfg: ServerConfig,
    oracle: Arc<Oracle>,
    telemetry: Arc<Telemetry>,
    cancel: CancellationToken,
) -> Result<()> {
    let state = AppState {
        oracle,
        telemetry: telemetry.clone(),
    };

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/prices", get(prices));
    if telemetry.enabled() {
        router = router.route("/metrics", get(metrics));
    }

    let read_timeout = parse_duration(&cfg.read_timeout).context("invalid server read_timeout")?;
    let mut router = router.with_state(state).layer(TimeoutLayer::new(read_timeout));

    if cfg.enable_cors {
        let origins: Vec<_> = cfg
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );
    }

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
    tracing::info!(listen_addr = %cfg.listen_addr, "starting price-feeder server");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("server error")
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let last_sync = state
        .oracle
        .get_last_price_sync_timestamp()
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_default();
    Json(json!({
        "status": STATUS_AVAILABLE,
        "oracle": {"last_sync": last_sync},
    }))
}

async fn prices(State(state): State<AppState>) -> impl IntoResponse {
    let prices: serde_json::Map<String, serde_json::Value> = state
        .oracle
        .get_prices()
        .into_iter()
        .map(|(denom, price)| (denom, json!(price.to_string())))
        .collect();
    Json(json!({ "prices": prices }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.telemetry.render())
}
