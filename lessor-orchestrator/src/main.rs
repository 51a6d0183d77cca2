use std::sync::Arc;

use anyhow::Context;
use lessor_orchestrator::api::create_router;
use lessor_orchestrator::migrations::run_inline_migrations;
use lessor_orchestrator::ports::EphemeralPortAllocator;
use lessor_orchestrator::provider_manager::MarketplaceManager;
use lessor_orchestrator::ssh::RusshConnector;
use lessor_orchestrator::store::{MemoryStore, PgStore, Store};
use lessor_orchestrator::web_proxy::TraefikRouteStore;
use lessor_orchestrator::{AppState, Collaborators, Settings};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,russh=warn,sqlx=warn")),
        )
        .init();

    let settings = Settings::from_env();

    let store: Arc<dyn Store> = match settings.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            run_inline_migrations(&pool).await?;
            tracing::info!("✅ Connected to Database");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("⚠️ DATABASE_URL not set, records are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let redis_client = match settings.redis_url.as_deref() {
        Some(url) => Some(redis::Client::open(url).context("Invalid REDIS_URL")?),
        None => None,
    };

    let connector = MarketplaceManager::connector_for(&settings.marketplace)
        .with_context(|| format!("Unknown marketplace: {}", settings.marketplace))?;

    let routes = TraefikRouteStore::new(
        settings.traefik_config_path.clone(),
        settings.domain.clone(),
        settings.proxy_upstream_host.clone(),
    );

    let listen_addr = settings.listen_addr;
    let state = AppState::new(
        settings,
        Collaborators {
            connector,
            store,
            ports: Arc::new(EphemeralPortAllocator),
            routes: Arc::new(routes),
            ssh: Arc::new(RusshConnector::default()),
            redis_client,
        },
    );

    state.monitor.start().await;

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    tracing::info!("🚀 Lessor Orchestrator listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    state.shutdown().await;
    Ok(())
}
