use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("device not found")]
    DeviceNotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("provider client not configured")]
    ProviderUnavailable,

    #[error("device token not found")]
    MissingDeviceToken,

    #[error("device token rejected by provider: {reason}")]
    InvalidDeviceToken { reason: String },

    #[error("provider rejected push ({status}): {reason}")]
    ProviderRejected { status: u16, reason: String },

    #[error("token signing error: {0}")]
    TokenSigning(String),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::MissingDeviceToken
            | AppError::InvalidDeviceToken { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::DeviceNotFound => StatusCode::NOT_FOUND,
            AppError::ProviderRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Encryption(_)
            | AppError::ProviderUnavailable
            | AppError::TokenSigning(_)
            | AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Database and signing details stay out of client responses.
        let message = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "database error".to_string()
            }
            AppError::TokenSigning(e) => {
                tracing::error!(error = %e, "provider token signing failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "code": status.as_u16(),
            "message": message,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_per_error_kind() {
        assert_eq!(
            AppError::DeviceNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::MissingDeviceToken.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::ProviderUnavailable.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::ProviderRejected {
                status: 429,
                reason: "TooManyRequests".into()
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn invalid_token_is_bad_request() {
        let err = AppError::InvalidDeviceToken {
            reason: "BadDeviceToken".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("BadDeviceToken"));
    }
}
