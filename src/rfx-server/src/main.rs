// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod devices;
mod error;
mod executor;
mod experiment;
mod machine;
mod monitor;
mod services;
mod state_monitor;
mod usb;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use rfx_app::{init_logging, ConfigFile};
use rfx_backend::{normalize_name, register_builtin_backends_on, RegistrationContext};
use rfx_core::DynResult;

use config::ServerConfig;
use experiment::{ExperimentRunner, OdMeasureExperiment};
use machine::Machine;
use services::Services;
use state_monitor::StateMonitor;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - bioreactor control daemon");

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Bridge backend to use (e.g. virtual)
    #[arg(short = 'b', long = "backend")]
    backend: Option<String>,
    /// Serial number of the USB bridge to open
    #[arg(short = 's', long = "serial")]
    serial: Option<String>,
    /// Close instead of waiting for the bridge when it is unplugged
    #[arg(long = "no-reconnect")]
    no_reconnect: bool,
}

/// CLI values win over the config file.
fn apply_cli(cli: &Cli, cfg: &mut ServerConfig, registry: &RegistrationContext) -> DynResult<()> {
    if let Some(ref backend) = cli.backend {
        cfg.connection.backend = backend.clone();
    }
    cfg.connection.backend = normalize_name(&cfg.connection.backend);
    if !registry.is_backend_registered(&cfg.connection.backend) {
        return Err(format!(
            "Unknown bridge backend: {} (available: {})",
            cfg.connection.backend,
            registry.registered_backends().join(", ")
        )
        .into());
    }
    if let Some(ref serial) = cli.serial {
        cfg.connection.serial_number = Some(serial.clone());
    }
    if cli.no_reconnect {
        cfg.connection.reconnect = false;
    }
    Ok(())
}

pub(crate) async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    if *shutdown_rx.borrow() {
        return;
    }
    while shutdown_rx.changed().await.is_ok() {
        if *shutdown_rx.borrow() {
            break;
        }
    }
}

async fn autoconnect(machine: &Arc<Machine>, cfg: &ServerConfig) -> Option<Arc<ExperimentRunner>> {
    if let Err(e) = machine.connect().await {
        // with reconnect enabled the monitor connects once the bridge shows up
        warn!("Initial connect failed: {}", e);
        return None;
    }
    if !cfg.experiment.autostart {
        return None;
    }
    let experiment = Arc::new(OdMeasureExperiment::new(
        machine,
        cfg.cycle_time(),
        cfg.experiment.max_cycles,
    ));
    match ExperimentRunner::start(machine.clone(), experiment) {
        Ok(runner) => Some(runner),
        Err(e) => {
            error!("Failed to start experiment: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let mut bootstrap_ctx = RegistrationContext::new();
    register_builtin_backends_on(&mut bootstrap_ctx);

    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_combined_toml());
        return Ok(());
    }

    let (mut cfg, config_path) = if let Some(ref path) = cli.config {
        let cfg = ServerConfig::load_from_file(path)?;
        (cfg, Some(path.clone()))
    } else {
        ServerConfig::load_from_default_paths()?
    };
    apply_cli(&cli, &mut cfg, &bootstrap_ctx)?;
    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }
    info!(
        "Starting rfx-server (backend: {}, serial: {})",
        cfg.connection.backend,
        cfg.connection.serial_number.as_deref().unwrap_or("any")
    );

    let bridge = bootstrap_ctx.build_bridge(&cfg.connection.backend, &cfg.backend_options())?;
    let services = Arc::new(Services::new());
    let machine = Machine::new(cfg.machine_options(), services, bridge)?;
    machine.start();

    let state_monitor = StateMonitor::new(&machine, cfg.state_publish_interval());
    let monitor_handle = state_monitor.spawn(machine.clone(), machine.shutdown_receiver());

    let runner = if cfg.connection.autoconnect {
        autoconnect(&machine, &cfg).await
    } else {
        None
    };

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    if let Some(runner) = runner {
        runner.stop().await;
    }
    machine.shutdown().await;
    if let Err(e) = monitor_handle.await {
        warn!("State monitor task failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RegistrationContext {
        let mut context = RegistrationContext::new();
        register_builtin_backends_on(&mut context);
        context
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from(["rfx-server", "-b", "Virtual", "-s", "RFX-9", "--no-reconnect"]);
        let mut cfg = ServerConfig::default();
        apply_cli(&cli, &mut cfg, &registry()).unwrap();
        assert_eq!(cfg.connection.backend, "virtual");
        assert_eq!(cfg.connection.serial_number.as_deref(), Some("RFX-9"));
        assert!(!cfg.connection.reconnect);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let cli = Cli::parse_from(["rfx-server", "--backend", "ftdi"]);
        let mut cfg = ServerConfig::default();
        let err = apply_cli(&cli, &mut cfg, &registry()).unwrap_err();
        assert_eq!(err.to_string(), "Unknown bridge backend: ftdi (available: virtual)");
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_when_already_set() {
        let (tx, rx) = watch::channel(true);
        tokio::time::timeout(std::time::Duration::from_millis(50), wait_for_shutdown(rx))
            .await
            .unwrap();
        drop(tx);
    }
}
