use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use orchestrate_service::config::Settings;
use orchestrate_service::events::{EventPublisher, NoopPublisher, RedisPublisher};
use orchestrate_service::provider_manager::ProviderManager;
use orchestrate_service::service::Orchestrator;
use orchestrate_service::store::{MemoryStore, PgStore, Store};
use orchestrate_service::{app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();

    let store: Arc<dyn Store> = match &settings.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            let store = PgStore::new(pool);
            // Source of truth is /sqlx-migrations at workspace root.
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("using postgres store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let publisher: Arc<dyn EventPublisher> = match &settings.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("Invalid REDIS_URL")?;
            tracing::info!("publishing operation events on redis");
            Arc::new(RedisPublisher::new(client))
        }
        None => Arc::new(NoopPublisher),
    };

    let provider = ProviderManager::get_provider(&settings).with_context(|| {
        format!(
            "provider '{}' is unavailable (not compiled in or missing credentials)",
            settings.provider
        )
    })?;
    tracing::info!(provider = provider.name(), "compute provider ready");

    let orchestrator = Orchestrator::new(store, provider, publisher, &settings);
    let router = app(AppState::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "orchestrate-service listening");
    axum::serve(listener, router).await?;
    Ok(())
}
