use anyhow::Context;
use chrono::Duration;
use std::env;
use tracing::warn;

/// Runtime settings read once at startup. A `.env` file is honored because
/// the binaries call `dotenv()` before constructing this.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub access_token_minutes: i64,
    pub refresh_token_days: i64,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub mail_from: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(secret) => secret,
            Err(_) => {
                warn!("JWT_SECRET not set, falling back to the development key");
                "dev-secret-key-change-me".to_string()
            }
        };

        Ok(Config {
            database_url,
            jwt_secret,
            access_token_minutes: parse_env("ACCESS_TOKEN_MINUTES", 15)?,
            refresh_token_days: parse_env("REFRESH_TOKEN_DAYS", 7)?,
            smtp_host: env::var("SMTP_HOST").ok(),
            smtp_port: parse_env("SMTP_PORT", 25)?,
            smtp_username: env::var("SMTP_USERNAME").ok(),
            smtp_password: env::var("SMTP_PASSWORD").ok(),
            mail_from: env::var("MAIL_FROM").unwrap_or_else(|_| "taskhub@localhost".to_string()),
        })
    }

    pub fn access_ttl(&self) -> Duration {
        Duration::minutes(self.access_token_minutes)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::days(self.refresh_token_days)
    }
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} is not a valid value")),
        Err(_) => Ok(default),
    }
}
