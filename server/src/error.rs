//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use soundtag_ipc::SwitchError;

/// Errors returned by route handlers, rendered as `{"error": message}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    /// Sounds directory failure; the io error is logged, not returned.
    #[error("{context}")]
    Storage {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Wrap an io error with a client-facing message.
    pub fn storage(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Storage { context, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Storage { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Switch(SwitchError::StartFailure { .. }) => StatusCode::BAD_GATEWAY,
            Self::Switch(SwitchError::EngineUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Switch(SwitchError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Storage { context, source } => warn!("{}: {}", context, source),
            other if status.is_server_error() => warn!("Request failed: {}", other),
            _ => {}
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
