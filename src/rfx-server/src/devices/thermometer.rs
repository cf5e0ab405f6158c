// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::any::Any;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use rfx_core::device::{guarded, DeviceFuture};
use rfx_core::driver::{Driver, TemperatureSensor};
use rfx_core::registry::{CommandArgs, CommandRegistry, CommandsInfo, HandlerFuture};
use rfx_core::sync::lock;
use rfx_core::{Device, DeviceCore, DeviceState, DynResult};

use super::require_connected;

pub struct Thermometer {
    core: DeviceCore,
    sensor: Arc<dyn TemperatureSensor>,
    value: Mutex<Option<f64>>,
    registry: CommandRegistry<Thermometer>,
}

impl Thermometer {
    pub fn new(name: impl Into<String>, sensor: Arc<dyn TemperatureSensor>) -> Self {
        Self {
            core: DeviceCore::new(name),
            sensor,
            value: Mutex::new(None),
            registry: CommandRegistry::new().register_validated(
                "measure",
                &[],
                require_connected::<Thermometer>,
                measure_cmd,
            ),
        }
    }

    /// Last measured temperature in °C.
    pub fn value(&self) -> Option<f64> {
        *lock(&self.value)
    }

    pub async fn measure(&self) -> DynResult<f64> {
        self.set_state(DeviceState::Working);
        let celsius = guarded(self, self.sensor.measure_celsius()).await?;
        *lock(&self.value) = Some(celsius);
        self.set_state(DeviceState::Operational);
        Ok(celsius)
    }
}

fn measure_cmd<'a>(thermometer: &'a Thermometer, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(json!(thermometer.measure().await?)) })
}

impl Device for Thermometer {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn reset_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn read_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.measure().await?;
            Ok(())
        })
    }

    fn probe(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let celsius = self.sensor.measure_celsius().await?;
            if celsius == 0.0 {
                return Err(format!("{}: sensor reads 0.0 °C", self.id()).into());
            }
            Ok(())
        })
    }

    fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        vec![self.sensor.clone() as Arc<dyn Driver>]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_state_string(&self) -> String {
        match self.state() {
            DeviceState::Working => "Measuring".to_string(),
            other => other.label().to_string(),
        }
    }

    fn extra_data(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("value".to_string(), json!(self.value()));
        extra
    }

    fn commands_info(&self) -> CommandsInfo {
        self.registry.info()
    }

    fn execute<'a>(&'a self, command: &'a str, args: &'a CommandArgs) -> DeviceFuture<'a, Value> {
        self.registry.dispatch(self, command, args)
    }
}
