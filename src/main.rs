use ontology_vcs::config::AppConfig;
use ontology_vcs::logic::{LockCoordinator, LockSettings, MaintenanceRunner};
use ontology_vcs::store::PostgresStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: ttl sweep every {}s, heartbeat sweep every {}s, compaction {}",
        config.locks.ttl_sweep_interval_secs,
        config.locks.heartbeat_sweep_interval_secs,
        if config.compaction.enabled { "enabled" } else { "disabled" }
    );

    log::info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let store = PostgresStore::new(
        &database_url,
        config.database.max_connections.unwrap_or(20),
    )
    .await?;

    log::info!("Running database migrations...");
    store.migrate().await?;

    let store = Arc::new(store);
    let coordinator = Arc::new(LockCoordinator::new(
        store.clone(),
        LockSettings::from(&config.locks),
    ));
    let runner = Arc::new(MaintenanceRunner::new(
        store,
        coordinator,
        config.locks.clone(),
        config.compaction.clone(),
    ));
    let handle = runner.start();

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");
    handle.shutdown().await;

    Ok(())
}
