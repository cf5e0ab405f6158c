// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for rfx-server.
//!
//! Config is loaded from the `[rfx-server]` section of `rfx.toml`.
//! Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./rfx.toml`
//! 3. `~/.config/rfx/rfx.toml`
//! 4. `/etc/rfx/rfx.toml`

use std::time::Duration;

use serde::{Deserialize, Serialize};
use rfx_app::ConfigFile;
use rfx_backend::{BackendOptions, BoardLayout};

use crate::machine::MachineOptions;

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    /// Bridge selection and hot-plug behavior
    pub connection: ConnectionConfig,
    /// Board layout and dispatch timing
    pub machine: MachineConfig,
    /// Built-in OD measurement experiment
    pub experiment: ExperimentConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bridge backend name (e.g. "virtual")
    pub backend: String,
    /// Serial number of the bridge to open; first one found when unset
    pub serial_number: Option<String>,
    /// Wait for the bridge to come back after it is unplugged
    pub reconnect: bool,
    /// Connect on startup
    pub autoconnect: bool,
    /// Link supervision period
    pub monitor_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backend: "virtual".to_string(),
            serial_number: None,
            reconnect: true,
            autoconnect: true,
            monitor_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub name: String,
    /// Commands allowed in flight at once
    pub ack_max: u32,
    pub pumps: u8,
    pub vials: u8,
    pub thermometers: u8,
    pub valve_settle_ms: u64,
    /// OD laser warm-up before each photodiode reading
    pub laser_settle_ms: u64,
    pub state_publish_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub await_poll_ms: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        let layout = BoardLayout::default();
        Self {
            name: "Bioreactor".to_string(),
            ack_max: 1,
            pumps: layout.pumps,
            vials: layout.vials,
            thermometers: layout.thermometers,
            valve_settle_ms: 500,
            laser_settle_ms: 20,
            state_publish_interval_ms: 500,
            stop_timeout_ms: 5000,
            await_poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Start the OD measurement experiment once connected
    pub autostart: bool,
    pub cycle_time_secs: f64,
    /// Unlimited when unset
    pub max_cycles: Option<u32>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            cycle_time_secs: 60.0,
            max_cycles: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;

        if self.connection.backend.trim().is_empty() {
            return Err("[connection].backend must not be empty".to_string());
        }
        if self.connection.monitor_interval_ms == 0 {
            return Err("[connection].monitor_interval_ms must be > 0".to_string());
        }

        if self.machine.ack_max == 0 {
            return Err("[machine].ack_max must be > 0".to_string());
        }
        self.layout()
            .validate()
            .map_err(|e| format!("[machine]: {}", e))?;
        if self.machine.await_poll_ms == 0 {
            return Err("[machine].await_poll_ms must be > 0".to_string());
        }
        if self.machine.state_publish_interval_ms == 0 {
            return Err("[machine].state_publish_interval_ms must be > 0".to_string());
        }

        if !(self.experiment.cycle_time_secs.is_finite() && self.experiment.cycle_time_secs > 0.0) {
            return Err("[experiment].cycle_time_secs must be > 0".to_string());
        }
        Ok(())
    }

    pub fn layout(&self) -> BoardLayout {
        BoardLayout {
            pumps: self.machine.pumps,
            vials: self.machine.vials,
            thermometers: self.machine.thermometers,
        }
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            serial_number: self.connection.serial_number.clone(),
            layout: self.layout(),
        }
    }

    pub fn machine_options(&self) -> MachineOptions {
        MachineOptions {
            name: self.machine.name.clone(),
            serial_number: self.connection.serial_number.clone(),
            reconnect: self.connection.reconnect,
            ack_max: self.machine.ack_max,
            layout: self.layout(),
            valve_settle: Duration::from_millis(self.machine.valve_settle_ms),
            laser_settle: Duration::from_millis(self.machine.laser_settle_ms),
            await_poll: Duration::from_millis(self.machine.await_poll_ms),
            stop_timeout: Duration::from_millis(self.machine.stop_timeout_ms),
            monitor_interval: Duration::from_millis(self.connection.monitor_interval_ms),
        }
    }

    pub fn state_publish_interval(&self) -> Duration {
        Duration::from_millis(self.machine.state_publish_interval_ms)
    }

    pub fn cycle_time(&self) -> Duration {
        Duration::from_secs_f64(self.experiment.cycle_time_secs)
    }

    /// Generate an example configuration wrapped under the `[rfx-server]`
    /// section header, suitable for use in a combined `rfx.toml` file.
    pub fn example_combined_toml() -> String {
        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(rename = "rfx-server")]
            inner: ServerConfig,
        }
        let example = ServerConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
            },
            connection: ConnectionConfig {
                serial_number: Some(rfx_backend::DEFAULT_VIRTUAL_SERIAL.to_string()),
                ..ConnectionConfig::default()
            },
            machine: MachineConfig::default(),
            experiment: ExperimentConfig {
                max_cycles: Some(100),
                ..ExperimentConfig::default()
            },
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    if let Some(level) = level {
        match level {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
                    level
                ))
            }
        }
    }
    Ok(())
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        "rfx-server"
    }
}
