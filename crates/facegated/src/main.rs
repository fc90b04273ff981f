use anyhow::{Context, Result};
use facegate_core::CosineMatcher;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod gate;
mod images;
mod store;

use config::{BusKind, Config};
use dbus_interface::{GateService, BUS_NAME, OBJECT_PATH};
use gate::Gate;
use images::ImageStore;
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facegated starting");

    let config = Config::load().context("loading configuration")?;
    let policy = config.policy().context("validating thresholds")?;
    tracing::info!(
        identify_threshold = policy.identify_threshold,
        duplicate_threshold = policy.duplicate_threshold,
        db = %config.db_path.display(),
        images = %config.image_dir.display(),
        "configuration loaded"
    );

    let models = facegate_models::provision(&config.models)
        .await
        .context("provisioning models")?;

    let engine = engine::spawn_engine(&models, Duration::from_secs(config.extract_timeout_secs))
        .context("starting inference engine")?;
    let model_version = engine.model_version().to_string();

    let store = SqliteStore::open(&config.db_path)
        .await
        .context("opening identity store")?;

    let gate = Gate::new(
        store,
        engine,
        CosineMatcher::new(policy),
        ImageStore::new(config.image_dir.clone()),
        config.max_image_bytes,
    );
    let service = GateService::new(Arc::new(gate), model_version);

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
