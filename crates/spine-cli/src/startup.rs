//! Shared binary startup: tracing, config, store, registries

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spine_core::config::SpineConfig;
use spine_core::dispatcher::Dispatcher;
use spine_core::registry::PipelineRegistry;
use spine_core::strategy::{period_registry, source_registry, PeriodRegistry, SourceRegistry};
use spine_storage::SqliteSpineStore;

use crate::registration;

/// Install the tracing subscriber; `-v` raises the default level to debug
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "spine=debug" } else { "spine=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Accept either a full sqlite URL or a bare file path for `--db`
pub fn normalize_db_url(db: &str) -> String {
    if db.starts_with("sqlite:") {
        db.to_string()
    } else {
        format!("sqlite://{db}")
    }
}

/// Everything a scheduler binary needs after startup
pub struct Runtime {
    pub config: SpineConfig,
    pub store: Arc<SqliteSpineStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub pipelines: Arc<PipelineRegistry>,
    pub sources: Arc<SourceRegistry>,
    pub periods: Arc<PeriodRegistry>,
}

/// Load config, open the store, build and populate the registries
pub async fn bootstrap(db_override: Option<&str>) -> anyhow::Result<Runtime> {
    let mut config = SpineConfig::from_env();
    if let Some(db) = db_override {
        config = config.with_database_url(normalize_db_url(db));
    }

    let store = Arc::new(SqliteSpineStore::connect(&config.database_url).await?);

    let pipelines = Arc::new(PipelineRegistry::new());
    let sources = Arc::new(source_registry());
    let periods = Arc::new(period_registry());
    registration::install(&pipelines, &sources, &periods)?;

    let dispatcher = Arc::new(Dispatcher::with_config(pipelines.clone(), config.clone()));

    Ok(Runtime {
        config,
        store,
        dispatcher,
        pipelines,
        sources,
        periods,
    })
}
