use axum::http::header;
use axum::response::IntoResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, TextEncoder};

static PUSHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "pushrelay_pushes_total",
            "Push submissions by device kind and outcome",
        ),
        &["kind", "outcome"],
    )
    .expect("failed to create pushrelay_pushes_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register pushrelay_pushes_total");
    counter
});

static LIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "pushrelay_live_connections",
        "Currently registered device sockets",
    )
    .expect("failed to create pushrelay_live_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register pushrelay_live_connections");
    gauge
});

pub fn record_push(kind: &str, outcome: &str) {
    PUSHES_TOTAL.with_label_values(&[kind, outcome]).inc();
}

pub fn set_live_connections(count: usize) {
    LIVE_CONNECTIONS.set(count as i64);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )
            .into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
