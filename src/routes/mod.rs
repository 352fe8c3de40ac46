use axum::extract::State;
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::state::AppState;

pub mod push;
pub mod register;
pub mod webhook;
pub mod ws;

pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/health", get(health))
        .route("/healthz", get(|| async { "ok" }))
        .route("/ping", get(ping))
        .route("/info", get(info))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route("/register", post(register::register).get(register::register))
        .route("/ws", get(ws::ws_handler))
        // Native push routes.
        .route("/push/:device_key", post(push::native_push))
        .route("/push/:device_key/*params", get(push::native_push_params))
        // Webhook adapters.
        .route("/webhook/:device_key", post(webhook::generic))
        .route("/webhook/:device_key/github", post(webhook::github))
        .route("/webhook/:device_key/gitlab", post(webhook::gitlab))
        .route("/webhook/:device_key/docker", post(webhook::docker))
        .route("/webhook/:device_key/gitea", post(webhook::gitea))
        // Bark-compatible catch-alls; static routes above take priority.
        .route(
            "/:device_key",
            post(push::bark_push).get(push::bark_push),
        )
        .route(
            "/:device_key/*params",
            get(push::bark_push_params).post(push::bark_push_params),
        );

    router
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().path().to_string();
                    tracing::span!(Level::INFO, "http", %method, %uri)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::info!(
                            status = %res.status(),
                            elapsed_ms = latency.as_millis() as u64,
                            "response"
                        );
                    },
                ),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().timestamp(),
    }))
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": 200,
        "message": "pong",
        "timestamp": Utc::now().timestamp(),
    }))
}

async fn info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let devices = state.store.count_devices().await.unwrap_or(0);
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "devices": devices,
        "connections": state.hub.connection_count().await,
        "time": Utc::now().timestamp(),
    }))
}
