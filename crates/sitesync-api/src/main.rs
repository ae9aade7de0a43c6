mod config;
mod error;
mod rate_limit;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use sitesync_core::authority::{AuthorityConfig, AuthorityStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sitesync_api=info".parse()?)
                .add_directive("sitesync_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting sitesync-api with config: {:?}", config);

    let authority_config = AuthorityConfig {
        version: config.version.clone(),
        assigns_ids: config.assigns_ids,
    };
    let authority = match &config.db_path {
        Some(path) => AuthorityStore::open_path(path.clone(), authority_config).await?,
        None => {
            tracing::warn!("SITESYNC_API_DB_PATH not set; authority data lives in memory");
            AuthorityStore::open_in_memory(authority_config).await?
        }
    };

    let state = AppState::new(config, authority);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("sitesync-api listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("Failed to listen for shutdown signal");
            }
        })
        .await?;
    tracing::info!("sitesync-api stopped");
    Ok(())
}
