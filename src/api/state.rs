use crate::api::auth::AuthKeys;
use crate::api::notify::Mailer;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use std::sync::Arc;

// Connection pool type
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

// Shared state
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub auth: Arc<AuthKeys>,
    pub mailer: Arc<Mailer>,
}
