mod auth;
mod config;
mod db;
mod error;
mod routes;


use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::auth::idp::IdpAdapter;
use crate::config::AppConfig;
use crate::db::Database;

/// Shared application state available to all handlers: the signing/crypto
/// secrets live inside `config`, the DB pool and the IdP adapter are the
/// only other process-wide singletons, constructed once here and handed to
/// handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub idp: IdpAdapter,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oidc_gateway=info,tower_http=info".into()),
        )
        .init();

    info!("Starting OIDC gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("Database initialized");

    let idp = IdpAdapter::new(&config);

    let state = Arc::new(AppState { config, db, idp });

    // Sweep expired session tokens and stale PKCE state hourly; nothing else
    // server-side needs cleanup since AuthState carries no session record.
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                cleanup_expired(&db).await;
            }
        });
    }

    let app = routes::build_router(state.clone());

    let addr = state.config.listen_addr.parse::<std::net::SocketAddr>()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn cleanup_expired(db: &Database) {
    match sqlx::query("DELETE FROM session_token WHERE expires < datetime('now')")
        .execute(&db.pool)
        .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            info!(deleted = result.rows_affected(), "Cleaned up expired sessions");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to clean up expired sessions"),
    }

    if let Err(e) = sqlx::query("DELETE FROM oidc_auth_state WHERE expires_at < datetime('now')")
        .execute(&db.pool)
        .await
    {
        warn!(error = %e, "Failed to clean up expired OIDC auth state");
    }
}
