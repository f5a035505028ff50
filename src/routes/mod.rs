use std::{ops::Deref, sync::Arc};

use axum::{
    Router,
    extract::{FromRequest, FromRequestParts, Request, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::Serialize;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::{
    error::ErrorBody,
    network::NetworkManager,
    observer::ObserverHandle,
    operator::Operator,
    vm_lock::VmLocks,
};

pub mod disks;
pub mod health;
pub mod network_config;
pub mod observer_status;
pub mod templates;
pub mod vms;

/// Everything a handler needs, reachable through one typed carrier instead of
/// ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub operator: Arc<Operator>,
    pub network: Arc<NetworkManager>,
    pub observer: ObserverHandle,
    pub vm_locks: VmLocks,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::handler))
        .route("/observer/status", get(observer_status::handler))
        .route("/network/config", get(network_config::handler))
        .route("/templates", post(templates::create::handler).get(templates::list::handler))
        .route("/templates/{name}", delete(templates::delete::handler))
        .route("/vms", post(vms::create::handler).get(vms::list::handler))
        .route("/vms/{id}", get(vms::get::handler).delete(vms::delete::handler))
        .route("/vms/{id}/actions/{action}", post(vms::actions::handler))
        .route("/disks", post(disks::create::handler).get(disks::list::handler))
        .route("/disks/{id}", get(disks::get::handler).delete(disks::delete::handler))
        .route("/disks/{id}/attach", post(disks::attach::handler))
        .route("/disks/{id}/detach", post(disks::detach::handler))
        .route(
            "/vms/{id}/metadata",
            get(vms::metadata::get_handler).put(vms::metadata::put_handler).delete(vms::metadata::delete_handler),
        )
        .with_state(state)
}

/// Behaves like `axum::Json` but reports both parse failures and validation
/// failures as `{"detail": ...}`.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    T: Validate,
    S: Send + Sync,
{
    type Rejection = (StatusCode, axum::Json<ErrorBody>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, body);

        let inner = match axum::Json::<T>::from_request(req, state).await {
            Ok(value) => value.0,
            Err(rejection) => {
                let payload = ErrorBody { detail: rejection.body_text() };
                return Err((rejection.status(), axum::Json(payload)));
            }
        };
        match inner.validate() {
            Ok(_) => Ok(Self(inner)),
            Err(e) => {
                let payload = ErrorBody { detail: e.to_string_pretty() };
                Err((StatusCode::UNPROCESSABLE_ENTITY, axum::Json(payload)))
            }
        }
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        axum::Json(self.0).into_response()
    }
}

/// `axum::extract::Query` with the same structured-error treatment as `Json`.
#[derive(Debug)]
pub struct Query<T>(pub T);

impl<S, T> FromRequestParts<S> for Query<T>
where
    axum::extract::Query<T>: FromRequestParts<S, Rejection = axum::extract::rejection::QueryRejection>,
    T: Validate,
    S: Send + Sync,
{
    type Rejection = (StatusCode, axum::Json<ErrorBody>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let inner = match axum::extract::Query::<T>::from_request_parts(parts, state).await {
            Ok(value) => value.0,
            Err(rejection) => {
                let payload = ErrorBody { detail: rejection.body_text() };
                return Err((rejection.status(), axum::Json(payload)));
            }
        };
        match inner.validate() {
            Ok(_) => Ok(Self(inner)),
            Err(e) => {
                let payload = ErrorBody { detail: e.to_string_pretty() };
                Err((StatusCode::UNPROCESSABLE_ENTITY, axum::Json(payload)))
            }
        }
    }
}

impl<T> Deref for Query<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

trait PrettyPrintError {
    fn to_string_pretty(&self) -> String {
        self.to_string_pretty_with_fields(vec![])
    }

    fn to_string_pretty_with_fields(&self, fields: Vec<&str>) -> String;
}

impl PrettyPrintError for ValidationErrors {
    fn to_string_pretty_with_fields(&self, fields: Vec<&str>) -> String {
        let mut output_errors = Vec::new();
        for (field, errors) in &self.0 {
            let mut fields = fields.clone();
            fields.push(field);
            output_errors.push(errors.to_string_pretty_with_fields(fields));
        }
        output_errors.join(", ")
    }
}

impl PrettyPrintError for ValidationErrorsKind {
    fn to_string_pretty_with_fields(&self, fields: Vec<&str>) -> String {
        match self {
            ValidationErrorsKind::Struct(errors) => errors.to_string_pretty_with_fields(fields),
            ValidationErrorsKind::List(errors) => {
                let mut output_errors = Vec::new();
                for (index, errors) in errors {
                    let mut fields = fields.clone();
                    let last = match fields.last() {
                        Some(last) => format!("{last}[{index}]"),
                        None => format!("[{index}]"),
                    };
                    fields.pop();
                    fields.push(&last);
                    output_errors.push(errors.to_string_pretty_with_fields(fields));
                }
                output_errors.join(", ")
            }
            ValidationErrorsKind::Field(errors) => {
                let field = fields.join(".");
                let errors = errors
                    .iter()
                    .map(|e| match e.code.as_ref() {
                        "range" => "value outside of expected range",
                        "regex" => "does not match expected format",
                        _ => e.code.as_ref(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("'{field}' {errors}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use validator::ValidationError;

    fn no_dots(value: &str) -> Result<(), ValidationError> {
        if value.contains(".") { Err(ValidationError::new("can't contain '.'")) } else { Ok(()) }
    }

    #[derive(Validate)]
    struct OuterModel {
        #[validate(range(min = 1))]
        number: u32,

        #[validate(custom(function = "no_dots"))]
        string: &'static str,
    }

    #[rstest]
    #[case::number(OuterModel { number: 0, string: "" }, "'number' value outside of expected range")]
    #[case::custom(OuterModel { number: 1, string: "a dot ." }, "'string' can't contain '.'")]
    fn validate_error_format(#[case] model: OuterModel, #[case] expected: &str) {
        let err = model.validate().expect_err("not an error");
        assert_eq!(err.to_string_pretty(), expected);
    }
}
