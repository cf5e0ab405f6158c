// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Culture vessel: groups the per-vial devices and tracks liquid volume.

use std::any::Any;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tracing::warn;

use rfx_core::device::DeviceFuture;
use rfx_core::driver::Driver;
use rfx_core::registry::{CommandArgs, CommandRegistry, CommandsInfo, HandlerFuture};
use rfx_core::sync::lock;
use rfx_core::{Device, DeviceCore, DeviceState};

use super::PumpRole;

pub const MIN_VOLUME_ML: f64 = 0.0;
pub const MAX_VOLUME_ML: f64 = 100.0;

pub struct Vial {
    core: DeviceCore,
    number: u8,
    thermometer_id: Option<String>,
    volume: Mutex<f64>,
    registry: CommandRegistry<Vial>,
}

impl Vial {
    pub fn new(number: u8, thermometer_id: Option<String>) -> Self {
        Self {
            core: DeviceCore::new(format!("Vial {number}")),
            number,
            thermometer_id,
            volume: Mutex::new(MIN_VOLUME_ML),
            registry: CommandRegistry::new().register("reset_volume", &[], reset_volume_cmd),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn valve_id(&self) -> String {
        format!("valve-{}", self.number)
    }

    pub fn stirrer_id(&self) -> String {
        format!("stirrer-{}", self.number)
    }

    pub fn od_sensor_id(&self) -> String {
        format!("od-sensor-{}", self.number)
    }

    pub fn thermometer_id(&self) -> Option<&str> {
        self.thermometer_id.as_deref()
    }

    pub fn volume(&self) -> f64 {
        *lock(&self.volume)
    }

    /// Account for liquid pumped in (positive) or out (negative).
    /// Returns the new volume, kept within the vessel bounds.
    pub fn add_volume(&self, delta_ml: f64) -> f64 {
        let mut volume = lock(&self.volume);
        let next = *volume + delta_ml;
        if !(MIN_VOLUME_ML..=MAX_VOLUME_ML).contains(&next) {
            warn!(
                "{}: volume {:.2} ml out of range, clamping to [{}, {}]",
                self.id(),
                next,
                MIN_VOLUME_ML,
                MAX_VOLUME_ML
            );
        }
        *volume = next.clamp(MIN_VOLUME_ML, MAX_VOLUME_ML);
        *volume
    }

    /// Volume change when `role`'s pump moves `volume_ml` into this vial.
    pub fn volume_delta(role: PumpRole, volume_ml: f64) -> f64 {
        match role {
            PumpRole::Media | PumpRole::Drug => volume_ml,
            PumpRole::Waste => -volume_ml,
        }
    }

    pub fn reset_volume(&self) {
        *lock(&self.volume) = MIN_VOLUME_ML;
    }
}

fn reset_volume_cmd<'a>(vial: &'a Vial, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        vial.reset_volume();
        Ok(json!(vial.volume()))
    })
}

impl Device for Vial {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn reset_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn read_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.set_state(DeviceState::Operational);
            Ok(())
        })
    }

    fn probe(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn extra_data(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("number".to_string(), json!(self.number));
        extra.insert("volume".to_string(), json!(self.volume()));
        extra.insert("valve".to_string(), json!(self.valve_id()));
        extra.insert("stirrer".to_string(), json!(self.stirrer_id()));
        extra.insert("od_sensor".to_string(), json!(self.od_sensor_id()));
        extra.insert("thermometer".to_string(), json!(self.thermometer_id));
        extra
    }

    fn commands_info(&self) -> CommandsInfo {
        self.registry.info()
    }

    fn execute<'a>(&'a self, command: &'a str, args: &'a CommandArgs) -> DeviceFuture<'a, Value> {
        self.registry.dispatch(self, command, args)
    }
}
