use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;

/// The wire shape for every error response: `{"detail": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// The five error kinds defined by the error handling design: validation,
/// not-found, conflict, operator failures, and unavailable dependencies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Operator(String),

    #[error("{0}")]
    DependencyUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, detail) = match &self {
            Self::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Conflict(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Operator(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::DependencyUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("not found".into()),
            other => Self::DependencyUnavailable(format!("database error: {other}")),
        }
    }
}

impl From<crate::operator::OperatorError> for ApiError {
    fn from(e: crate::operator::OperatorError) -> Self {
        Self::Operator(e.to_string())
    }
}
