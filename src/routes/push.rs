//! Push ingress: native routes and the Bark-compatible surface.
//!
//! Requests arrive as JSON bodies, query strings, or path segments; query
//! values override path values, and everything funnels into one
//! [`PushRequest`] handed to the dispatcher.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::models::{BarkResponse, PushRequest, PushResponse};
use crate::state::AppState;

/// Default title for body-only native pushes.
const DEFAULT_TITLE: &str = "Pushrelay";

/// Query parameters arrive as strings; booleans accept `1`/`true`.
#[derive(Debug, Default, Deserialize)]
pub struct PushQuery {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub body: Option<String>,
    pub group: Option<String>,
    pub sound: Option<String>,
    pub url: Option<String>,
    pub icon: Option<String>,
    pub image: Option<String>,
    pub level: Option<String>,
    pub call: Option<String>,
    pub badge: Option<String>,
    #[serde(rename = "isArchive")]
    pub is_archive: Option<String>,
    pub id: Option<String>,
}

fn truthy(v: &str) -> bool {
    v == "1" || v == "true"
}

impl PushQuery {
    fn apply(self, request: &mut PushRequest) {
        let set = |target: &mut String, value: Option<String>| {
            if let Some(v) = value {
                if !v.is_empty() {
                    *target = v;
                }
            }
        };
        set(&mut request.title, self.title);
        set(&mut request.subtitle, self.subtitle);
        set(&mut request.body, self.body);
        set(&mut request.group, self.group);
        set(&mut request.sound, self.sound);
        set(&mut request.url, self.url);
        set(&mut request.icon, self.icon);
        set(&mut request.image, self.image);
        set(&mut request.level, self.level);
        set(&mut request.id, self.id);
        if let Some(v) = self.call {
            request.call = truthy(&v);
        }
        if let Some(v) = self.is_archive {
            request.is_archive = truthy(&v);
        }
        if let Some(v) = self.badge.and_then(|b| b.parse().ok()) {
            request.badge = v;
        }
    }
}

/// `POST /push/:device_key`: JSON body, query fills the gaps.
pub async fn native_push(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    Query(query): Query<PushQuery>,
    body: Option<Json<PushRequest>>,
) -> Result<Json<PushResponse>, AppError> {
    let mut request = body.map(|Json(b)| b).unwrap_or_default();
    query.apply(&mut request);

    let outcome = state.dispatcher.push(&device_key, &request).await?;
    Ok(Json(PushResponse::ok(outcome.message_id().to_string())))
}

/// `GET|POST /push/:device_key/<body>` or `/push/:device_key/<title>/<body>`.
pub async fn native_push_params(
    State(state): State<AppState>,
    Path((device_key, params)): Path<(String, String)>,
    Query(query): Query<PushQuery>,
) -> Result<Json<PushResponse>, AppError> {
    let trimmed = params.trim_start_matches('/');
    let (title, body) = match trimmed.split_once('/') {
        Some((title, body)) => (title.to_string(), body.to_string()),
        None => (DEFAULT_TITLE.to_string(), trimmed.to_string()),
    };

    let mut request = PushRequest {
        title,
        body,
        ..Default::default()
    };
    query.apply(&mut request);

    let outcome = state.dispatcher.push(&device_key, &request).await?;
    Ok(Json(PushResponse::ok(outcome.message_id().to_string())))
}

/// `POST|GET /:device_key`: Bark push with body or query parameters.
pub async fn bark_push(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    Query(query): Query<PushQuery>,
    body: Option<Json<PushRequest>>,
) -> Result<Json<BarkResponse>, AppError> {
    let mut request = body.map(|Json(b)| b).unwrap_or_default();
    query.apply(&mut request);

    state.dispatcher.push(&device_key, &request).await?;
    Ok(Json(BarkResponse::ok(None)))
}

/// `GET|POST /:device_key/<...>`: title/subtitle/body from path segments.
pub async fn bark_push_params(
    State(state): State<AppState>,
    Path((device_key, params)): Path<(String, String)>,
    Query(query): Query<PushQuery>,
) -> Result<Json<BarkResponse>, AppError> {
    let mut request = parse_bark_segments(params.trim_start_matches('/'));
    query.apply(&mut request);

    state.dispatcher.push(&device_key, &request).await?;
    Ok(Json(BarkResponse::ok(None)))
}

/// `<body>`, `<title>/<body>`, or `<title>/<subtitle>/<body>`; extra
/// segments fold into the body.
fn parse_bark_segments(params: &str) -> PushRequest {
    let parts: Vec<&str> = params.split('/').collect();
    let mut request = PushRequest::default();
    match parts.len() {
        0 => {}
        1 => request.body = parts[0].to_string(),
        2 => {
            request.title = parts[0].to_string();
            request.body = parts[1].to_string();
        }
        _ => {
            request.title = parts[0].to_string();
            request.subtitle = parts[1].to_string();
            request.body = parts[2..].join("/");
        }
    }
    request
}
