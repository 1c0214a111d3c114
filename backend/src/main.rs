use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Duration;
use mutua_backend::auth::{CredentialVerifier, StaticCredentials, TokenKeys};
use mutua_backend::config;
use mutua_backend::db::Database;
use mutua_backend::{app, with_metrics, AppContext};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let secret = config::JWT_SECRET.as_str();

    let db = Database::connect_with_fallback(
        config::DATABASE_URL.as_str(),
        config::FALLBACK_DATABASE_URL.as_str(),
        *config::DB_MAX_CONNECTIONS,
    )
    .await?;
    db.ensure_schema().await?;
    if *config::SEED_REFERENCE_DATA {
        db.seed_reference_data().await?;
        if *config::SEED_SAMPLE_ACTIVITY {
            db.seed_sample_activity().await?;
        }
    }

    let credentials: Arc<dyn CredentialVerifier> = Arc::new(StaticCredentials::new(
        config::TEST_USER.as_str(),
        config::TEST_PASSWORD.as_str(),
    )?);
    let tokens = Arc::new(TokenKeys::new(
        secret,
        Duration::minutes(*config::ACCESS_TOKEN_TTL_MINUTES),
    ));

    let app = with_metrics(app(AppContext {
        db,
        tokens,
        credentials,
    }));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
