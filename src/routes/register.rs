//! Device registration: upsert by device key, kind auto-detected from the
//! credentials supplied.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::crypto;
use crate::error::AppError;
use crate::models::{BarkResponse, DeviceKind};
use crate::state::AppState;
use crate::store::NewDevice;

/// Accepted from JSON body or query string; legacy key aliases included.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RegisterParams {
    #[serde(default)]
    pub device_key: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub device_token: String,
    #[serde(default)]
    pub devicetoken: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub name: String,
}

fn first_non_empty(values: &[&str]) -> String {
    values
        .iter()
        .find(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_default()
}

impl RegisterParams {
    /// Body values win; query fills the gaps.
    fn merged(body: Option<Self>, query: Self) -> Self {
        let body = body.unwrap_or_default();
        Self {
            device_key: first_non_empty(&[
                &body.device_key,
                &body.key,
                &query.device_key,
                &query.key,
            ]),
            key: String::new(),
            device_type: first_non_empty(&[&body.device_type, &query.device_type]),
            device_token: first_non_empty(&[
                &body.device_token,
                &body.devicetoken,
                &query.device_token,
                &query.devicetoken,
            ]),
            devicetoken: String::new(),
            public_key: first_non_empty(&[&body.public_key, &query.public_key]),
            name: first_non_empty(&[&body.name, &query.name]),
        }
    }

    fn detect_kind(&self) -> Result<DeviceKind, AppError> {
        match self.device_type.as_str() {
            "ios" => Ok(DeviceKind::Ios),
            "android" => Ok(DeviceKind::Android),
            "" => {
                if !self.device_token.is_empty() {
                    Ok(DeviceKind::Ios)
                } else if !self.public_key.is_empty() {
                    Ok(DeviceKind::Android)
                } else {
                    Err(AppError::BadRequest(
                        "device_token or public_key is required".into(),
                    ))
                }
            }
            other => Err(AppError::BadRequest(format!(
                "unknown device_type: {other}"
            ))),
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Query(query): Query<RegisterParams>,
    body: Option<Json<RegisterParams>>,
) -> Result<Json<BarkResponse>, AppError> {
    let params = RegisterParams::merged(body.map(|Json(b)| b), query);
    let kind = params.detect_kind()?;

    if let Some(mut device) = state.store.get_device(&params.device_key).await? {
        device.kind = kind;
        if !params.device_token.is_empty() {
            device.device_token = params.device_token;
        }
        if !params.public_key.is_empty() {
            device.public_key = params.public_key;
        }
        if !params.name.is_empty() {
            device.name = params.name;
        }
        state.store.update_device(&device).await?;
        tracing::info!(device_key = %device.device_key, kind = %device.kind.as_str(), "device updated");
        return Ok(Json(BarkResponse::ok(Some(serde_json::json!({
            "key": device.device_key,
            "device_key": device.device_key,
            "device_type": device.kind.as_str(),
        })))));
    }

    let device_key = if params.device_key.is_empty() {
        crypto::generate_device_key()
    } else {
        params.device_key.clone()
    };

    let device = state
        .store
        .create_device(&NewDevice {
            device_key,
            kind,
            device_token: params.device_token,
            public_key: params.public_key,
            name: params.name,
        })
        .await?;
    tracing::info!(device_key = %device.device_key, kind = %device.kind.as_str(), "device registered");

    Ok(Json(BarkResponse::ok(Some(serde_json::json!({
        "key": device.device_key,
        "device_key": device.device_key,
        "device_type": device.kind.as_str(),
    })))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_overrides_query() {
        let body = RegisterParams {
            device_key: "from-body".into(),
            ..Default::default()
        };
        let query = RegisterParams {
            device_key: "from-query".into(),
            device_token: "tok".into(),
            ..Default::default()
        };
        let merged = RegisterParams::merged(Some(body), query);
        assert_eq!(merged.device_key, "from-body");
        assert_eq!(merged.device_token, "tok");
    }

    #[test]
    fn legacy_aliases_accepted() {
        let query = RegisterParams {
            key: "k1".into(),
            devicetoken: "t1".into(),
            ..Default::default()
        };
        let merged = RegisterParams::merged(None, query);
        assert_eq!(merged.device_key, "k1");
        assert_eq!(merged.device_token, "t1");
    }

    #[test]
    fn kind_detection() {
        let with_token = RegisterParams {
            device_token: "t".into(),
            ..Default::default()
        };
        assert_eq!(with_token.detect_kind().unwrap(), DeviceKind::Ios);

        let with_key = RegisterParams {
            public_key: "p".into(),
            ..Default::default()
        };
        assert_eq!(with_key.detect_kind().unwrap(), DeviceKind::Android);

        let explicit = RegisterParams {
            device_type: "android".into(),
            device_token: "t".into(),
            ..Default::default()
        };
        assert_eq!(explicit.detect_kind().unwrap(), DeviceKind::Android);

        assert!(RegisterParams::default().detect_kind().is_err());
    }
}
