pub mod auth;
pub mod categories;
pub mod error;
pub mod filters;
pub mod notify;
pub mod pagination;
pub mod permissions;
mod state;
pub mod subtasks;
pub mod tasks;

use crate::config::Config;
use crate::tables::Status;
use axum::extract::{FromRequest, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Json;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use auth::AuthKeys;
use error::ApiError;
use notify::Mailer;
pub use state::{AppState, Pool};

/// JSON body extractor that reports malformed payloads through `ApiError`,
/// keeping body errors in the same field-keyed shape as the validators.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct AppJson<T>(pub T);

/// For `Option<Option<T>>` fields: an absent key deserializes to `None`
/// while an explicit `null` becomes `Some(None)`, so a PATCH can clear a
/// nullable column without touching the others.
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    serde::Deserialize::deserialize(deserializer).map(Some)
}

pub(crate) fn validate_title(raw: &str) -> Result<&str, ApiError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ApiError::field("title", "This field may not be blank."));
    }
    if title.chars().count() > 200 {
        return Err(ApiError::field(
            "title",
            "Ensure this field has no more than 200 characters.",
        ));
    }
    Ok(title)
}

/// Strict status parsing for write payloads. Listing filters stay lenient,
/// but a create or update with a bogus status is an input error.
pub(crate) fn status_choice(raw: &str) -> Result<Status, ApiError> {
    Status::parse(raw)
        .ok_or_else(|| ApiError::field("status", format!("\"{raw}\" is not a valid choice.")))
}

pub fn create_router(pool: Pool, config: &Config) -> Router {
    let state = AppState {
        pool: Arc::new(pool),
        auth: Arc::new(AuthKeys::new(
            &config.jwt_secret,
            config.access_ttl(),
            config.refresh_ttl(),
        )),
        mailer: Arc::new(Mailer::from_config(config)),
    };

    Router::new()
        .merge(auth::create_router())
        .merge(tasks::create_router())
        .merge(subtasks::create_router())
        .merge(categories::create_router())
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        "{} {} -> {} in {:.2?}",
        method,
        uri,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}
