use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::error;

/// Field name to error messages, serialized as the body of a 400 response.
/// Request-level problems go under the `non_field_errors` key.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(FieldErrors),
    #[error("{0}")]
    Unauthorized(String),
    #[error("permission denied")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    NotFoundDetail(&'static str),
    #[error("database error: {0}")]
    Database(#[source] DieselError),
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    /// Single-field validation error.
    pub fn field(field: &str, message: impl Into<String>) -> ApiError {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        ApiError::Validation(errors)
    }

    pub fn unauthorized(detail: impl Into<String>) -> ApiError {
        ApiError::Unauthorized(detail.into())
    }
}

/// Database-level constraint failures surface as field-keyed validation
/// errors rather than a 500; the constraint name tells us which field to
/// blame.
impl From<DieselError> for ApiError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => ApiError::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, ref info) => {
                let (field, message) = match info.constraint_name() {
                    Some(name) if name.contains("categor") => {
                        ("name", "Category with this name already exists.")
                    }
                    Some(name) if name.contains("title") => {
                        ("title", "Task with this title already exists.")
                    }
                    Some(name) if name.contains("email") => {
                        ("email", "A user with this email already exists.")
                    }
                    Some(name) if name.contains("username") => {
                        ("username", "A user with that username already exists.")
                    }
                    _ => (
                        "non_field_errors",
                        "This value conflicts with an existing record.",
                    ),
                };
                ApiError::field(field, message)
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, ref info) => {
                let field = match info.constraint_name() {
                    Some(name) if name.contains("categor") => "categories",
                    Some(name) if name.contains("task") => "task",
                    Some(name) if name.contains("owner") => "owner",
                    _ => "non_field_errors",
                };
                ApiError::field(field, "Invalid reference - object does not exist.")
            }
            other => ApiError::Database(other),
        }
    }
}

/// Malformed or mistyped JSON bodies become a 400 in the same field-keyed
/// shape instead of axum's default rejection. A body that merely omits a
/// required field is blamed on that field, like a blank submission.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let text = rejection.body_text();
        if let Some(field) = missing_field_name(&text) {
            return ApiError::field(field, "This field is required.");
        }
        ApiError::field("non_field_errors", text)
    }
}

// Serde spells an absent required field as missing field `name`
fn missing_field_name(text: &str) -> Option<&str> {
    let (_, rest) = text.split_once("missing field `")?;
    let (name, _) = rest.split_once('`')?;
    Some(name)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(errors) => {
                (StatusCode::BAD_REQUEST, Json(json!(errors))).into_response()
            }
            ApiError::Unauthorized(detail) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": detail })),
            )
                .into_response(),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "detail": "You do not have permission to perform this action."
                })),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": "Not found." })),
            )
                .into_response(),
            ApiError::NotFoundDetail(detail) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": detail })),
            )
                .into_response(),
            ApiError::Database(err) => {
                error!("database error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": "Internal server error." })),
                )
                    .into_response()
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "Internal server error." })),
            )
                .into_response(),
        }
    }
}
