use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flag_engine::audit::AuditLog;
use flag_engine::cache::{FlagCache, InMemoryCache};
use flag_engine::config::Config;
use flag_engine::evaluation::EvaluationEngine;
use flag_engine::flags::FlagRegistry;
use flag_engine::repository::postgres::{PgAuditStore, PgFlagRepository, PgSegmentResolver};
use flag_engine::routes;
use flag_engine::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!().run(&db).await?;

    let cache: Arc<dyn FlagCache> = Arc::new(InMemoryCache::new());

    let registry = Arc::new(FlagRegistry::new(
        Arc::new(PgFlagRepository::new(db.clone())),
        cache.clone(),
        AuditLog::new(Arc::new(PgAuditStore::new(db.clone()))),
        config.definition_ttl,
    ));

    let engine = Arc::new(EvaluationEngine::new(
        registry.clone(),
        Arc::new(PgSegmentResolver::new(db.clone())),
        cache,
        Arc::new(config.overrides.clone()),
        config.evaluation_ttl,
        config.evaluation_budget,
    ));

    let state = AppState {
        registry,
        engine,
        jwt_secret: config.jwt_secret.as_str().into(),
        sdk_key: config.sdk_key.as_str().into(),
    };

    let app = routes::routes(state);

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;

    info!(addr = %config.addr(), overrides = config.overrides.len(), "flag service listening");

    axum::serve(listener, app).await?;
    Ok(())
}
