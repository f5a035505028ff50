use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use validator::Validate;

use crate::{
    db::{Template, TemplateRepository, TemplateRepositoryError},
    error::ApiError,
    routes::{AppState, Json},
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTemplateRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(range(min = 1))]
    pub cpu_count: i64,
    #[validate(range(min = 1))]
    pub ram_amount: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("template '{0}' already exists")]
    AlreadyExists(String),

    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("template '{0}' is referenced by at least one VM")]
    InUse(String),

    #[error("database error: {0}")]
    Db(String),
}

impl From<TemplateRepositoryError> for HandlerError {
    fn from(e: TemplateRepositoryError) -> Self {
        match e {
            TemplateRepositoryError::AlreadyExists(n) => Self::AlreadyExists(n),
            TemplateRepositoryError::NotFound(n) => Self::NotFound(n),
            TemplateRepositoryError::InUse(n) => Self::InUse(n),
            TemplateRepositoryError::Db(e) => Self::Db(e.to_string()),
        }
    }
}

impl From<HandlerError> for ApiError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::AlreadyExists(_) | HandlerError::InUse(_) => ApiError::Conflict(e.to_string()),
            HandlerError::NotFound(_) => ApiError::NotFound(e.to_string()),
            HandlerError::Db(_) => ApiError::DependencyUnavailable(e.to_string()),
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

pub mod create {
    use super::*;

    pub async fn handler(
        state: State<AppState>,
        request: Json<CreateTemplateRequest>,
    ) -> Result<(StatusCode, Json<Template>), HandlerError> {
        let repo = crate::db::SqliteTemplateRepository::new(state.db.clone());
        let template = repo.create(&request.name, request.cpu_count, request.ram_amount).await?;
        Ok((StatusCode::CREATED, Json(template)))
    }
}

pub mod list {
    use super::*;

    pub async fn handler(state: State<AppState>) -> Result<Json<Vec<Template>>, HandlerError> {
        let repo = crate::db::SqliteTemplateRepository::new(state.db.clone());
        Ok(Json(repo.list().await?))
    }
}

pub mod delete {
    use super::*;

    pub async fn handler(state: State<AppState>, Path(name): Path<String>) -> Result<StatusCode, HandlerError> {
        let repo = crate::db::SqliteTemplateRepository::new(state.db.clone());
        repo.delete(&name).await?;
        Ok(StatusCode::NO_CONTENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_rejects_zero_cpu() {
        let req = CreateTemplateRequest { name: "small".into(), cpu_count: 0, ram_amount: 4 };
        assert!(req.validate().is_err());
    }

    #[test]
    fn create_request_accepts_valid_values() {
        let req = CreateTemplateRequest { name: "small".into(), cpu_count: 2, ram_amount: 4 };
        assert!(req.validate().is_ok());
    }
}
