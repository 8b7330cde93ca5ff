pub mod api;
pub mod config;
pub mod schema;
pub mod tables;

pub const AUTH_API: &str = "api/auth";
pub const TASKS_API: &str = "api/tasks";
pub const SUBTASKS_API: &str = "api/subtasks";
pub const CATEGORIES_API: &str = "api/categories";

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::api::auth::AuthKeys;
    use crate::api::notify::Mailer;
    use crate::api::{AppState, Pool};
    use chrono::Duration;
    use diesel::prelude::*;
    use diesel::r2d2::ConnectionManager;
    use std::sync::Arc;

    /// Direct connection for model-level tests. Returns `None` when no
    /// database is configured so those tests can skip instead of fail.
    pub fn try_connection() -> Option<PgConnection> {
        dotenv::dotenv().ok();
        let url = std::env::var("DATABASE_URL").ok()?;
        PgConnection::establish(&url).ok()
    }

    /// Shared state for calling handlers directly against the test database.
    pub fn try_state() -> Option<AppState> {
        dotenv::dotenv().ok();
        let url = std::env::var("DATABASE_URL").ok()?;
        let manager = ConnectionManager::<PgConnection>::new(url);
        let pool: Pool = diesel::r2d2::Pool::builder()
            .max_size(5)
            .build(manager)
            .ok()?;
        Some(AppState {
            pool: Arc::new(pool),
            auth: Arc::new(AuthKeys::new(
                "unit-test-secret",
                Duration::minutes(15),
                Duration::days(7),
            )),
            mailer: Arc::new(Mailer::disabled()),
        })
    }
}
