use anyhow::{Context, Result};
use rollcall_core::{RoleGovernor, Roster};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod error;
mod store;

use config::{BusKind, Config};
use dbus_interface::RollcallService;
use store::SqliteStore;

const BUS_NAME: &str = "org.rollcall.Rollcall1";
const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        general_threshold = config.policy.general,
        compact_threshold = config.policy.compact,
        bootstrap_admin = ?config.bootstrap_admin.as_ref().map(|r| r.as_str()),
        bus = ?config.bus,
        "configuration loaded"
    );

    let missing = rollcall_vision::missing_models(&config.model_dir);
    if !missing.is_empty() {
        anyhow::bail!(
            "missing model files: {}",
            missing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let store = SqliteStore::open(&config.db_path).context("opening database")?;
    let governor = RoleGovernor::new(config.bootstrap_admin.clone());
    let roster = Roster::open(store, governor, config.policy).context("building embedding index")?;
    let snapshot = roster.snapshot();
    if !snapshot.violations().is_empty() {
        tracing::error!(
            violations = snapshot.violations().len(),
            "stored identities failed integrity checks; see status"
        );
    }
    tracing::info!(identities = snapshot.len(), "embedding index ready");

    let pipelines = rollcall_vision::load_pipelines(&config.vision()).context("loading models")?;
    let engine = engine::spawn_engine(pipelines)?;

    let service = RollcallService::new(Arc::new(roster), engine, config.enroll_probes);
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

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
