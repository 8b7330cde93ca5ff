use anyhow::Context;
use clap::{Parser, Subcommand};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use std::net::SocketAddr;
use taskhub_rest_api::api;
use taskhub_rest_api::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// The address to bind to
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        addr: SocketAddr,
    },
    /// Create an account directly in the database
    CreateUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Staff accounts may modify ownerless records
        #[arg(long)]
        staff: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { addr } => {
            let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
            let pool = r2d2::Pool::builder()
                .build(manager)
                .context("Failed to create connection pool")?;

            let app = api::create_router(pool, &config);

            info!("Listening on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            axum::serve(listener, app).await?;
        }
        Commands::CreateUser {
            username,
            email,
            password,
            first_name,
            last_name,
            staff,
        } => {
            let mut conn = PgConnection::establish(&config.database_url)
                .context("Failed to connect to database")?;

            let user = api::auth::create_user(
                &mut conn,
                &username,
                &email,
                &password,
                &first_name,
                &last_name,
                staff,
            )
            .map_err(|err| match err {
                api::error::ApiError::Validation(fields) => {
                    let details: Vec<String> = fields
                        .into_iter()
                        .map(|(field, messages)| format!("{field}: {}", messages.join(" ")))
                        .collect();
                    anyhow::anyhow!("Could not create user: {}", details.join("; "))
                }
                other => anyhow::anyhow!("Could not create user: {other}"),
            })?;

            println!("Created user {} (id {})", user.username, user.id);
        }
    }

    Ok(())
}
