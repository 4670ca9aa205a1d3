use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, QuerierError>;

#[derive(Debug, Error)]
pub enum QuerierError {
    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operator '{op}' not supported for tag '{tag}'")]
    UnsupportedOperator { op: String, tag: String },

    #[error("function '{0}' not supported")]
    UnsupportedFunction(String),

    #[error("malformed literal {value} for tag '{tag}': {reason}")]
    MalformedLiteral {
        tag: String,
        value: String,
        reason: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("backing store query failed: {0:#}")]
    BackingStore(anyhow::Error),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl QuerierError {
    pub(crate) fn unsupported_operator(op: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::UnsupportedOperator {
            op: op.into(),
            tag: tag.into(),
        }
    }

    pub(crate) fn malformed(
        tag: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedLiteral {
            tag: tag.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for QuerierError {
    fn into_response(self) -> Response {
        let status = match self {
            QuerierError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            QuerierError::Auth => StatusCode::UNAUTHORIZED,
            QuerierError::InvalidRequest(_)
            | QuerierError::UnsupportedOperator { .. }
            | QuerierError::UnsupportedFunction(_)
            | QuerierError::MalformedLiteral { .. } => StatusCode::BAD_REQUEST,
            QuerierError::NotFound(_) => StatusCode::NOT_FOUND,
            QuerierError::BackingStore(_) => StatusCode::BAD_GATEWAY,
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
