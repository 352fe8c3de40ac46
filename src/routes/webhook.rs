//! Webhook adapters: each vendor payload is formatted into `(title, body)`
//! and handed to the dispatcher like any other push.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::models::{PushRequest, PushResponse};
use crate::state::AppState;

const WEBHOOK_GROUP: &str = "webhook";

#[derive(Debug, Default, Deserialize)]
pub struct GitHubWebhook {
    #[serde(default)]
    pub r#ref: String,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub pusher: Author,
    #[serde(default)]
    pub head_commit: Commit,
    #[serde(default)]
    pub forced: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GitLabWebhook {
    #[serde(default)]
    pub object_kind: String,
    #[serde(default)]
    pub r#ref: String,
    #[serde(default)]
    pub project: GitLabProject,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub commit: Commit,
}

#[derive(Debug, Default, Deserialize)]
pub struct GitLabProject {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerHubWebhook {
    #[serde(default)]
    pub push_data: DockerPushData,
    #[serde(default)]
    pub repository: DockerRepository,
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerPushData {
    #[serde(default)]
    pub pusher: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerRepository {
    #[serde(default)]
    pub repo_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GiteaWebhook {
    #[serde(default)]
    pub r#ref: String,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub pusher: Author,
    #[serde(default)]
    pub head_commit: Commit,
}

async fn push_formatted(
    state: &AppState,
    device_key: &str,
    title: String,
    body: String,
) -> Result<Json<PushResponse>, AppError> {
    let request = PushRequest {
        title,
        body,
        group: WEBHOOK_GROUP.into(),
        ..Default::default()
    };
    let outcome = state.dispatcher.push(device_key, &request).await?;
    Ok(Json(PushResponse::ok(outcome.message_id().to_string())))
}

/// `POST /webhook/:device_key`: best-effort extraction from arbitrary JSON,
/// falling back to the raw body as plain text.
pub async fn generic(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    body: Bytes,
) -> Result<Json<PushResponse>, AppError> {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
        if let Some(object) = json.as_object() {
            let (title, text) = parse_generic_json(object);
            return push_formatted(&state, &device_key, title, text).await;
        }
    }

    let text = String::from_utf8_lossy(&body).into_owned();
    push_formatted(&state, &device_key, "Webhook".into(), text).await
}

pub async fn github(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    headers: HeaderMap,
    payload: Option<Json<GitHubWebhook>>,
) -> Result<Json<PushResponse>, AppError> {
    let event = header_value(&headers, "X-GitHub-Event");
    let body = match payload {
        Some(Json(webhook)) => format_github(&webhook, &event),
        None => "Invalid GitHub webhook format".into(),
    };
    push_formatted(&state, &device_key, "GitHub".into(), body).await
}

pub async fn gitlab(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    payload: Option<Json<GitLabWebhook>>,
) -> Result<Json<PushResponse>, AppError> {
    let body = match payload {
        Some(Json(webhook)) => format_gitlab(&webhook),
        None => "Invalid GitLab webhook format".into(),
    };
    push_formatted(&state, &device_key, "GitLab".into(), body).await
}

pub async fn docker(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    payload: Option<Json<DockerHubWebhook>>,
) -> Result<Json<PushResponse>, AppError> {
    let body = match payload {
        Some(Json(webhook)) => format_docker(&webhook),
        None => "Invalid Docker Hub webhook format".into(),
    };
    push_formatted(&state, &device_key, "Docker Hub".into(), body).await
}

pub async fn gitea(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    headers: HeaderMap,
    payload: Option<Json<GiteaWebhook>>,
) -> Result<Json<PushResponse>, AppError> {
    let event = header_value(&headers, "X-Gitea-Event");
    let body = match payload {
        Some(Json(webhook)) => format_gitea(&webhook, &event),
        None => "Invalid Gitea webhook format".into(),
    };
    push_formatted(&state, &device_key, "Gitea".into(), body).await
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn branch_of(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

fn format_github(webhook: &GitHubWebhook, event: &str) -> String {
    match event {
        "push" => {
            let mut body = format!(
                "[push] {}\nbranch: {}\n",
                webhook.repository.full_name,
                branch_of(&webhook.r#ref)
            );
            if webhook.forced {
                body.push_str("force push\n");
            } else {
                body.push_str(&format!("commit: {}\n", webhook.head_commit.message));
            }
            body.push_str(&format!("pusher: {}", webhook.pusher.name));
            body
        }
        "ping" => format!("[ping] {}", webhook.repository.full_name),
        other => format!("[{}] {}", other, webhook.repository.full_name),
    }
}

fn format_gitlab(webhook: &GitLabWebhook) -> String {
    match webhook.object_kind.as_str() {
        "push" => format!(
            "[push] {}\nbranch: {}\ncommit: {}\npusher: {}",
            webhook.project.name,
            branch_of(&webhook.r#ref),
            webhook.commit.message,
            webhook.user_name
        ),
        "merge_request" => format!("[merge request] {}", webhook.project.name),
        other => format!("[{}] {}", other, webhook.project.name),
    }
}

fn format_docker(webhook: &DockerHubWebhook) -> String {
    format!(
        "[docker] {}\ntag: {}\npusher: {}",
        webhook.repository.repo_name, webhook.push_data.tag, webhook.push_data.pusher
    )
}

fn format_gitea(webhook: &GiteaWebhook, event: &str) -> String {
    match event {
        "push" => format!(
            "[push] {}\nbranch: {}\ncommit: {}\npusher: {}",
            webhook.repository.full_name,
            branch_of(&webhook.r#ref),
            webhook.head_commit.message,
            webhook.pusher.name
        ),
        other => format!("[{}] {}", other, webhook.repository.full_name),
    }
}

const TITLE_FIELDS: &[&str] = &[
    "title", "subject", "name", "event", "event_type", "action", "type", "alert_name",
];
const BODY_FIELDS: &[&str] = &[
    "body",
    "message",
    "content",
    "text",
    "description",
    "summary",
    "details",
];

/// Pick a plausible title and body out of arbitrary JSON; append the full
/// payload when a specific field was extracted.
fn parse_generic_json(data: &serde_json::Map<String, serde_json::Value>) -> (String, String) {
    let lookup = |fields: &[&str]| -> Option<String> {
        for field in fields {
            for key in [
                field.to_string(),
                capitalize(field),
                field.to_uppercase(),
            ] {
                match data.get(&key) {
                    Some(serde_json::Value::String(s)) if !s.is_empty() => {
                        return Some(s.clone());
                    }
                    Some(serde_json::Value::Object(o)) => {
                        return serde_json::to_string_pretty(o).ok();
                    }
                    _ => {}
                }
            }
        }
        None
    };

    let full = serde_json::to_string_pretty(data).unwrap_or_default();

    let title = match lookup(TITLE_FIELDS) {
        Some(t) => format!("Webhook: {t}"),
        None => "Webhook".into(),
    };

    let body = match lookup(BODY_FIELDS) {
        Some(extracted) if extracted != full => {
            format!("{extracted}\n\n--- full payload ---\n{full}")
        }
        Some(extracted) => extracted,
        None => full,
    };

    (title, body)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
