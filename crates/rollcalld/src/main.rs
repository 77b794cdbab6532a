use anyhow::{anyhow, Context, Result};
use rollcall_core::CommandEmbedder;
use rollcall_ledger::SqliteLedger;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    let command = config
        .embedder_command
        .as_deref()
        .ok_or_else(|| anyhow!("no embedding extractor configured; set ROLLCALL_EMBEDDER_COMMAND"))?;
    let embedder = CommandEmbedder::from_command_line(command)
        .ok_or_else(|| anyhow!("invalid extractor command line: {command:?}"))?;

    std::fs::create_dir_all(&config.enroll_dir)
        .with_context(|| format!("failed to create {}", config.enroll_dir.display()))?;
    let ledger = SqliteLedger::open(&config.ledger_path)?;

    tracing::info!(
        enroll_dir = %config.enroll_dir.display(),
        ledger = %config.ledger_path.display(),
        threshold = config.match_threshold,
        extractor = embedder.program(),
        "configuration loaded"
    );

    let engine = engine::spawn_engine(Engine::new(
        Box::new(embedder),
        config.enroll_dir.clone(),
        Box::new(ledger),
        config.match_threshold,
    ))?;

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine, &config))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
