//! API error taxonomy with stable machine-readable codes

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
    },

    #[error("operator authentication required")]
    Unauthorized,

    #[error("consistency check failed: {0}")]
    Consistency(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code,
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Consistency(_) => "CONSISTENCY_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Consistency(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Validation problems go back verbatim; everything else is logged
        // server-side and the caller gets the stable code only.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = self.code(), error = %self, "request failed");
            match &self {
                Self::Consistency(detail) => detail.clone(),
                _ => "internal error".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = json!({
            "status": "error",
            "code": self.code(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400_with_code() {
        let err = ApiError::validation("INVALID_RANGE", "start after end");
        assert_eq!(err.code(), "INVALID_RANGE");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn consistency_maps_to_500_with_stable_code() {
        let err = ApiError::Consistency("rollup drift on 2026-08-20".into());
        assert_eq!(err.code(), "CONSISTENCY_ERROR");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unauthorized_maps_to_401() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }
}
