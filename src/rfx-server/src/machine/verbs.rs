// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Business-level verbs and job control.
//!
//! Every verb turns into one or more queued entries routed through
//! [`Machine::send_commands`]; device work itself runs on the device
//! manager so only one operation touches the bus at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use rfx_core::driver::MotorProfile;
use rfx_core::queue::marker::Action;
use rfx_core::queue::AwaitCondition;
use rfx_core::registry::{
    arg_f64, arg_str, opt_f64, CommandArgs, CommandError, CommandRegistry, CommandsInfo,
    HandlerFuture,
};
use rfx_core::{CommandEntry, Device, DeviceState, DynResult, QueueMarker};

use super::{find_device, Machine, Routing, SendOptions};
use crate::devices::{Pump, PumpRole, StirrerSpeed, Vial};
use crate::error::MachineError;
use crate::executor::{DeviceManager, ExecOptions};

/// Deferred call of a named device command on the device manager.
fn device_call(
    executor: &DeviceManager,
    device_id: &str,
    command: &'static str,
    args: CommandArgs,
    options: ExecOptions,
) -> Action {
    let executor = executor.clone();
    let device_id = device_id.to_string();
    Box::new(move || {
        Box::pin(async move {
            executor.execute(&device_id, command, args, options).await?;
            Ok(())
        })
    })
}

fn to_args(value: Value) -> CommandArgs {
    match value {
        Value::Object(map) => map,
        _ => CommandArgs::new(),
    }
}

fn speed_value(speed: StirrerSpeed) -> Value {
    match speed {
        StirrerSpeed::Level(level) => json!(level),
        StirrerSpeed::Duty(duty) => json!(duty),
    }
}

impl Machine {
    fn device_entry(&self, verb: &str, device_id: &str, command: &'static str, args: CommandArgs) -> CommandEntry {
        let call = device_call(&self.executor, device_id, command, args, ExecOptions::default());
        CommandEntry::new(QueueMarker::send(call)).with_type(format!("{verb}:{device_id}"))
    }

    /// Run `command` on a pump, then poll until it is idle or failed.
    /// Clearing the queues stops the pump.
    fn pump_await(&self, pump: &Arc<Pump>, command: &'static str, args: CommandArgs) -> AwaitCondition {
        let polled = pump.clone();
        let stop = device_call(&self.executor, pump.id(), "stop", CommandArgs::new(), ExecOptions::high_priority());
        AwaitCondition::new(move || {
            let pump = polled.clone();
            async move { Ok(pump.is_idle_or_error().await) }
        })
        .with_callback(device_call(&self.executor, pump.id(), command, args, ExecOptions::default()))
        .with_cancel(stop)
        .with_interval(self.options.await_poll)
    }

    fn stop_other_pumps(&self, keep: &str) -> Vec<CommandEntry> {
        self.pumps
            .iter()
            .filter(|pump| pump.id() != keep)
            .map(|pump| CommandEntry::new(QueueMarker::AwaitCondition(self.pump_await(pump, "stop", CommandArgs::new()))))
            .collect()
    }

    pub fn open_valve(&self, device_id: &str, options: SendOptions) -> Result<Routing, MachineError> {
        self.valve(device_id)?;
        self.send_command(self.device_entry("open_valve", device_id, "open", CommandArgs::new()), options)
    }

    pub fn close_valve(&self, device_id: &str, options: SendOptions) -> Result<Routing, MachineError> {
        self.valve(device_id)?;
        self.send_command(self.device_entry("close_valve", device_id, "close", CommandArgs::new()), options)
    }

    pub fn set_stirrer_speed(
        &self,
        device_id: &str,
        speed: StirrerSpeed,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        self.stirrer(device_id)?;
        let args = to_args(json!({ "speed": speed_value(speed) }));
        self.send_command(self.device_entry("set_stirrer_speed", device_id, "set_speed", args), options)
    }

    pub fn measure_temperature(&self, device_id: &str, options: SendOptions) -> Result<Routing, MachineError> {
        self.thermometer(device_id)?;
        self.send_command(
            self.device_entry("measure_temperature", device_id, "measure", CommandArgs::new()),
            options,
        )
    }

    pub fn measure_od(&self, device_id: &str, options: SendOptions) -> Result<Routing, MachineError> {
        self.od_sensor(device_id)?;
        self.send_command(
            self.device_entry("measure_od", device_id, "measure_od", CommandArgs::new()),
            options,
        )
    }

    /// Move `volume` ml with one pump, or spin it continuously when
    /// `volume` is zero or absent. Every other pump is stopped first.
    pub fn pump_pump(
        &self,
        device_id: &str,
        volume: Option<f64>,
        speed: Option<f64>,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        let pump = self.pump(device_id)?;
        let mut batch = self.stop_other_pumps(device_id);
        let cmd_type = format!("pump_pump:{device_id}");
        match volume.filter(|v| *v != 0.0) {
            Some(volume) => {
                let args = to_args(json!({ "volume": volume, "rot_per_sec": speed }));
                batch.push(
                    CommandEntry::new(QueueMarker::AwaitCondition(self.pump_await(pump, "pump", args)))
                        .with_type(cmd_type),
                );
            }
            // a continuous run never goes idle on its own
            None => {
                let args = to_args(json!({ "forward": true, "rot_per_sec": speed }));
                batch.push(self.device_entry("pump_pump", device_id, "run", args).with_type(cmd_type));
            }
        }
        self.send_commands(batch, options)
    }

    /// Stop a pump through the high-priority path.
    pub fn pump_stop(&self, device_id: &str) -> Result<Routing, MachineError> {
        self.pump(device_id)?;
        let stop = device_call(&self.executor, device_id, "stop", CommandArgs::new(), ExecOptions::high_priority());
        self.send_emergency_command(CommandEntry::new(QueueMarker::send(stop)).with_type(format!("pump_stop:{device_id}")))
    }

    pub fn pump_set_profile(
        &self,
        device_id: &str,
        profile: MotorProfile,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        self.pump(device_id)?;
        let args = to_args(json!(profile));
        self.send_command(self.device_entry("pump_set_profile", device_id, "set_profile", args), options)
    }

    pub fn vial_add_media(
        &self,
        vial_id: &str,
        volume: f64,
        speed: Option<f64>,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        self.vial_pump(PumpRole::Media, vial_id, volume, speed, options)
    }

    pub fn vial_add_drug(
        &self,
        vial_id: &str,
        volume: f64,
        speed: Option<f64>,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        self.vial_pump(PumpRole::Drug, vial_id, volume, speed, options)
    }

    pub fn vial_waste(
        &self,
        vial_id: &str,
        volume: f64,
        speed: Option<f64>,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        self.vial_pump(PumpRole::Waste, vial_id, volume, speed, options)
    }

    /// Stop the other pumps, route the shared line to one vial and pump.
    /// The batch is queued atomically so no manual command lands
    /// between the valve changes and the pump run.
    fn vial_pump(
        &self,
        role: PumpRole,
        vial_id: &str,
        volume: f64,
        speed: Option<f64>,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        let vial = find_device(&self.vials, vial_id)?.clone();
        let pump = self.pump_for(role)?;
        let vial_valve = vial.valve_id();
        self.valve(&vial_valve)?;

        let mut batch = self.stop_other_pumps(pump.id());
        batch.push(CommandEntry::new(QueueMarker::send(device_call(
            &self.executor,
            &vial_valve,
            "open",
            CommandArgs::new(),
            ExecOptions::default(),
        ))));
        for valve in self.valves.iter().filter(|v| v.id() != vial_valve) {
            batch.push(CommandEntry::new(QueueMarker::send(device_call(
                &self.executor,
                valve.id(),
                "close",
                CommandArgs::new(),
                ExecOptions::default(),
            ))));
        }
        let args = to_args(json!({ "volume": volume, "rot_per_sec": speed }));
        let machine = self.weak();
        let delta = Vial::volume_delta(role, volume);
        batch.push(
            CommandEntry::new(QueueMarker::AwaitCondition(self.pump_await(pump, "pump", args)))
                .with_type(format!("vial_pump:{}", vial.id()))
                .on_sent(move || {
                    let now = vial.add_volume(delta);
                    debug!("{}: volume now {:.2} ml", vial.id(), now);
                    if let Some(machine) = machine.upgrade() {
                        machine.publish_device_data(&vial.get_data());
                    }
                }),
        );
        self.send_commands(batch, options)
    }

    fn transition(&self, action: &'static str, allowed: &[DeviceState], via: DeviceState) -> Result<(), MachineError> {
        self.require_state(action, allowed)?;
        self.set_state(via);
        Ok(())
    }

    pub fn start_job(&self) -> Result<(), MachineError> {
        self.transition("start a job", &[DeviceState::Operational], DeviceState::Starting)?;
        self.job_on_hold.reset();
        self.set_state(DeviceState::Working);
        self.continue_sending();
        Ok(())
    }

    pub fn pause_job(&self) -> Result<(), MachineError> {
        self.transition("pause the job", &[DeviceState::Working], DeviceState::Pausing)?;
        self.hold_jobs();
        self.set_state(DeviceState::Paused);
        Ok(())
    }

    pub fn resume_job(&self) -> Result<(), MachineError> {
        self.transition("resume the job", &[DeviceState::Paused], DeviceState::Resuming)?;
        self.set_state(DeviceState::Working);
        self.release_jobs();
        Ok(())
    }

    /// Drop all queued work, cancel the in-flight await marker and
    /// return to manual control.
    pub fn cancel_job(&self) -> Result<(), MachineError> {
        let state = self.state();
        if !state.is_busy() {
            return Err(MachineError::InvalidTransition {
                action: "cancel the job",
                state,
            });
        }
        self.set_state(DeviceState::Cancelling);
        self.command_queue_clear();
        self.job_on_hold.reset();
        self.set_state(DeviceState::Operational);
        Ok(())
    }

    pub fn finish_job(&self) -> Result<(), MachineError> {
        self.transition(
            "finish the job",
            &[DeviceState::Working, DeviceState::Paused],
            DeviceState::Finishing,
        )?;
        self.job_on_hold.reset();
        self.set_state(DeviceState::Operational);
        self.continue_sending();
        Ok(())
    }

    /// Self-test every device. Maps device id to whether it passed.
    pub async fn test_devices(&self) -> Result<BTreeMap<String, bool>, MachineError> {
        if self.connection_state() != super::ConnectionState::Operational {
            return Err(MachineError::NotConnected);
        }
        let mut results = BTreeMap::new();
        for device in &self.devices {
            let passed = device.test().await;
            if passed {
                info!("{}: Ok", device.id());
            } else {
                warn!("{}: Fail ({})", device.id(), device.error());
            }
            results.insert(device.id().to_string(), passed);
        }
        Ok(results)
    }

    pub fn get_commands_info(&self) -> CommandsInfo {
        self.registry.info()
    }

    pub fn device_commands_info(&self, device_id: &str) -> Result<CommandsInfo, MachineError> {
        self.device(device_id)
            .map(|device| device.commands_info())
            .ok_or_else(|| MachineError::UnknownDevice(device_id.to_string()))
    }

    /// Run a machine verb by name.
    pub async fn execute_command(&self, name: &str, args: &CommandArgs) -> DynResult<Value> {
        self.registry.dispatch(self, name, args).await
    }
}

fn routed(result: Result<Routing, MachineError>) -> DynResult<Value> {
    Ok(json!(result?))
}

fn job_state(machine: &Machine, result: Result<(), MachineError>) -> DynResult<Value> {
    result?;
    Ok(json!(machine.state().id()))
}

fn open_valve_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { routed(m.open_valve(arg_str(args, "device_id")?, SendOptions::from_args(args)?)) })
}

fn close_valve_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { routed(m.close_valve(arg_str(args, "device_id")?, SendOptions::from_args(args)?)) })
}

fn set_stirrer_speed_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let speed = args
            .get("speed")
            .ok_or_else(|| CommandError::MissingArg("speed".to_string()))?;
        let speed = StirrerSpeed::from_value(speed)?;
        routed(m.set_stirrer_speed(arg_str(args, "device_id")?, speed, SendOptions::from_args(args)?))
    })
}

fn measure_temperature_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        routed(m.measure_temperature(arg_str(args, "device_id")?, SendOptions::from_args(args)?))
    })
}

fn measure_od_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { routed(m.measure_od(arg_str(args, "device_id")?, SendOptions::from_args(args)?)) })
}

fn pump_pump_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        routed(m.pump_pump(
            arg_str(args, "device_id")?,
            opt_f64(args, "volume")?,
            opt_f64(args, "speed")?,
            SendOptions::from_args(args)?,
        ))
    })
}

fn pump_stop_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { routed(m.pump_stop(arg_str(args, "device_id")?)) })
}

fn pump_set_profile_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let defaults = MotorProfile::default();
        let profile = MotorProfile {
            max_speed_rps: opt_f64(args, "max_speed_rps")?.unwrap_or(defaults.max_speed_rps),
            acceleration: opt_f64(args, "acceleration")?.unwrap_or(defaults.acceleration),
            deceleration: opt_f64(args, "deceleration")?.unwrap_or(defaults.deceleration),
            kval_hold: opt_f64(args, "kval_hold")?.unwrap_or(defaults.kval_hold),
            kval_run: opt_f64(args, "kval_run")?.unwrap_or(defaults.kval_run),
        };
        routed(m.pump_set_profile(arg_str(args, "device_id")?, profile, SendOptions::from_args(args)?))
    })
}

fn vial_args(args: &CommandArgs) -> Result<(&str, f64, Option<f64>, SendOptions), CommandError> {
    Ok((
        arg_str(args, "device_id")?,
        arg_f64(args, "volume")?,
        opt_f64(args, "speed")?,
        SendOptions::from_args(args)?,
    ))
}

fn vial_add_media_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let (vial, volume, speed, options) = vial_args(args)?;
        routed(m.vial_add_media(vial, volume, speed, options))
    })
}

fn vial_add_drug_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let (vial, volume, speed, options) = vial_args(args)?;
        routed(m.vial_add_drug(vial, volume, speed, options))
    })
}

fn vial_waste_cmd<'a>(m: &'a Machine, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let (vial, volume, speed, options) = vial_args(args)?;
        routed(m.vial_waste(vial, volume, speed, options))
    })
}

fn command_queue_clear_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        m.command_queue_clear();
        Ok(Value::Null)
    })
}

fn start_job_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { job_state(m, m.start_job()) })
}

fn pause_job_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { job_state(m, m.pause_job()) })
}

fn resume_job_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { job_state(m, m.resume_job()) })
}

fn cancel_job_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { job_state(m, m.cancel_job()) })
}

fn finish_job_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { job_state(m, m.finish_job()) })
}

fn hold_jobs_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        m.hold_jobs();
        Ok(json!(m.jobs_on_hold()))
    })
}

fn release_jobs_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        m.release_jobs();
        Ok(json!(m.jobs_on_hold()))
    })
}

fn test_devices_cmd<'a>(m: &'a Machine, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(json!(m.test_devices().await?)) })
}

pub(super) fn machine_registry() -> CommandRegistry<Machine> {
    CommandRegistry::new()
        .register("open_valve", &["device_id"], open_valve_cmd)
        .register("close_valve", &["device_id"], close_valve_cmd)
        .register("set_stirrer_speed", &["device_id", "speed"], set_stirrer_speed_cmd)
        .register("measure_temperature", &["device_id"], measure_temperature_cmd)
        .register("measure_od", &["device_id"], measure_od_cmd)
        .register("pump_pump", &["device_id", "volume", "speed"], pump_pump_cmd)
        .register("pump_stop", &["device_id"], pump_stop_cmd)
        .register(
            "pump_set_profile",
            &["device_id", "max_speed_rps", "acceleration", "deceleration", "kval_hold", "kval_run"],
            pump_set_profile_cmd,
        )
        .register("vial_add_media", &["device_id", "volume", "speed"], vial_add_media_cmd)
        .register("vial_add_drug", &["device_id", "volume", "speed"], vial_add_drug_cmd)
        .register("vial_waste", &["device_id", "volume", "speed"], vial_waste_cmd)
        .register("command_queue_clear", &[], command_queue_clear_cmd)
        .register("start_job", &[], start_job_cmd)
        .register("pause_job", &[], pause_job_cmd)
        .register("resume_job", &[], resume_job_cmd)
        .register("cancel_job", &[], cancel_job_cmd)
        .register("finish_job", &[], finish_job_cmd)
        .register("hold_jobs", &[], hold_jobs_cmd)
        .register("release_jobs", &[], release_jobs_cmd)
        .register("test_devices", &[], test_devices_cmd)
}
