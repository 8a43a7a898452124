mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;

use tracing_subscriber::EnvFilter;

use crate::frame::ErrorCode;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::AppConfig::from_env().inspect_err(|e| {
        tracing::error!(code = e.error_code(), error = %e, "invalid configuration");
    })?;

    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
    let port = config.port;
    let state = state::AppState::new(pool, config);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "tripboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}
