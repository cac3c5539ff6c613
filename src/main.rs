use std::{net::SocketAddr, sync::Arc};

use secrecy::ExposeSecret;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hk_license::api::{self, AppState};
use hk_license::config::{Config, StoreBackend};
use hk_license::db;
use hk_license::jobs::challenge_cleanup;
use hk_license::services::{authenticator, mailer::HttpMailer};
use hk_license::store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hk_license=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting license server...");

    let config = Config::from_env()?;
    tracing::info!(backend = ?config.store_backend, "Configuration loaded successfully");

    match (config.store_backend, config.database_url.clone()) {
        (StoreBackend::Postgres, Some(database_url)) => {
            let pool = db::create_pool(&database_url, config.database_max_connections).await?;
            tracing::info!("Database pool created");

            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations completed");

            serve(Arc::new(PgStore::new(pool)), config).await
        }
        (StoreBackend::Postgres, None) => {
            anyhow::bail!("DATABASE_URL is required for the postgres backend")
        }
        (StoreBackend::Memory, _) => {
            tracing::warn!("Using the in-memory store; all data is lost on shutdown");
            serve(Arc::new(MemoryStore::new()), config).await
        }
    }
}

async fn serve<S>(store: Arc<S>, config: Config) -> anyhow::Result<()>
where
    S: Store + 'static,
{
    if let (Some(username), Some(password)) = (
        config.bootstrap_admin_username.as_deref(),
        config.bootstrap_admin_password.as_ref(),
    ) {
        authenticator::bootstrap_admin(store.as_ref(), username, password.expose_secret())
            .await?;
    }

    let mailer = HttpMailer::new(config.mailer())?;
    if !mailer.is_configured() {
        tracing::warn!("MAIL_API_URL not set; verification codes cannot be delivered");
    }

    let mut scheduler = challenge_cleanup::start(store.clone(), &config.challenge_cleanup_cron).await?;

    let state = AppState::new(store, Arc::new(mailer), &config);
    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    scheduler.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, cleaning up...");
}
