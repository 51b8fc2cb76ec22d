//! Engine binary for the traffic light simulation.
//!
//! Wires the configured signal heads to a conductor and runs the demo
//! cycle until it completes or the process is interrupted.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `trafficlight-config.yaml` (or the path in
//!    `TRAFFICLIGHT_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Build the program catalog and one logging sink per head
//! 4. Create and start the conductor
//! 5. Run the demo cycle until done or Ctrl-C
//! 6. Stop, join, and log the final status

mod cycle;
mod error;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trafficlight_core::conductor::alternating_roles;
use trafficlight_core::{
    Conductor, ConductorSettings, Diagnostic, OutputSink, ProgramCatalog,
    SignalUnit, TracingSink, TrafficlightConfig,
};
use trafficlight_types::ProgramVariant;

use crate::cycle::CycleEnd;
use crate::error::EngineError;

/// Environment variable naming the configuration file.
const CONFIG_PATH_ENV: &str = "TRAFFICLIGHT_CONFIG";

/// Configuration file used when `TRAFFICLIGHT_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "trafficlight-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if configuration, construction, or shutdown fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config_path = std::env::var_os(CONFIG_PATH_ENV)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let (config, loaded) = load_config(&config_path)?;

    // 2. Initialize structured logging.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!("trafficlight-engine starting");
    if loaded {
        info!(path = %config_path.display(), "Configuration file loaded");
    } else {
        info!(path = %config_path.display(), "Config file not found, using defaults");
    }
    info!(
        tick_interval_ms = config.conductor.tick_interval_ms,
        join_grace_ms = config.conductor.join_grace_ms,
        units = config.units.len(),
        max_cycles = config.cycle.max_cycles,
        "Configuration loaded"
    );

    // 3-4. Build and start the conductor.
    let conductor = build_conductor(&config)?;
    let reporter = tokio::spawn(tally_diagnostics(conductor.subscribe_diagnostics()));
    conductor.start().await?;

    // 5-6. Run the demo cycle, then stop and join.
    let end = cycle::run_and_drain(&conductor, &config.cycle, interrupted()).await?;
    match end {
        CycleEnd::Completed { cycles } => info!(cycles, "Demo cycle finished"),
        CycleEnd::Interrupted { cycles } => info!(cycles, "Interrupted, shut down"),
    }

    let status = serde_json::to_string(&conductor.status()).map_err(EngineError::from)?;
    info!(status = %status, "Final status");

    // Dropping the conductor closes the diagnostics channel.
    drop(conductor);
    match tokio::time::timeout(Duration::from_secs(1), reporter).await {
        Ok(Ok(tally)) => info!(diagnostics = ?tally, "Diagnostics summary"),
        Ok(Err(err)) => warn!(error = %err, "diagnostics reporter failed"),
        Err(_elapsed) => warn!("diagnostics reporter did not finish"),
    }

    info!("trafficlight-engine shutdown complete");
    Ok(())
}

/// Load the configuration file, falling back to defaults if it is absent.
///
/// Returns the configuration and whether the file was found.
fn load_config(path: &Path) -> Result<(TrafficlightConfig, bool), EngineError> {
    if path.exists() {
        Ok((TrafficlightConfig::from_file(path)?, true))
    } else {
        let mut config = TrafficlightConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok((config, false))
    }
}

/// Create one logging-sink unit per configured head and hand them to a
/// new conductor.
fn build_conductor(config: &TrafficlightConfig) -> Result<Conductor, EngineError> {
    let catalog = ProgramCatalog::from_config(&config.programs)?;
    let roles = config
        .roles()
        .unwrap_or_else(|| alternating_roles(config.units.len()));
    let init = catalog.plan(ProgramVariant::Initialization)?;

    let units = config
        .units
        .iter()
        .zip(&roles)
        .map(|(unit, &role)| {
            let sink: Arc<dyn OutputSink> = Arc::new(TracingSink::new(unit.name.clone()));
            SignalUnit::new(unit.name.clone(), sink, &init.assignment(role))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if config.roles().is_none() && units.len() > 2 {
        warn!(
            units = units.len(),
            "no roles configured; pairing heads by alternation"
        );
    }
    let conductor = Conductor::with_roles(
        units,
        roles,
        catalog,
        ConductorSettings::from(&config.conductor),
    )?;
    Ok(conductor)
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C; running until the cycle completes");
        std::future::pending::<()>().await;
    }
}

/// Count diagnostics by kind until the channel closes.
async fn tally_diagnostics(
    mut rx: broadcast::Receiver<Diagnostic>,
) -> BTreeMap<&'static str, u64> {
    let mut tally = BTreeMap::new();
    loop {
        match rx.recv().await {
            Ok(diagnostic) => {
                let count = tally.entry(diagnostic.kind()).or_insert(0_u64);
                *count = count.saturating_add(1);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "diagnostics reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tally
}
