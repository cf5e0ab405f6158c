// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Peristaltic pump on a stepper motor.

use std::any::Any;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use rfx_core::device::{guarded, DeviceFuture};
use rfx_core::driver::{Driver, MotorProfile, MotorStatus, StepperMotor};
use rfx_core::registry::{
    arg_f64, opt_bool, opt_f64, CommandArgs, CommandError, CommandRegistry, CommandsInfo,
    HandlerFuture,
};
use rfx_core::sync::lock;
use rfx_core::{Device, DeviceCore, DeviceState, DynResult};

use super::require_connected;

/// Calibration points: (rotations, millilitres per rotation).
const CALIBRATION: [(f64, f64); 4] = [(1.0, 10.0), (5.0, 9.5), (10.0, 9.0), (50.0, 8.5)];

/// Which shared reservoir a pump serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpRole {
    Media,
    Drug,
    Waste,
}

impl PumpRole {
    pub fn pump_number(self) -> u8 {
        match self {
            Self::Media => 1,
            Self::Drug => 2,
            Self::Waste => 4,
        }
    }

    pub fn pump_id(self) -> String {
        format!("pump-{}", self.pump_number())
    }
}

/// Rotations needed to move `volume` millilitres.
///
/// The coefficient is interpolated between the calibration points that
/// bracket the volume. Volumes past the last point use its coefficient;
/// volumes below the first point interpolate across the whole table.
pub fn calculate_rotations(volume: f64) -> f64 {
    let point_volume = |(rot, coef): (f64, f64)| rot * coef;
    let first = CALIBRATION[0];
    let last = CALIBRATION[CALIBRATION.len() - 1];
    if volume >= point_volume(last) {
        return volume / last.1;
    }
    let (lower, upper) = CALIBRATION
        .windows(2)
        .find(|pair| volume >= point_volume(pair[0]) && volume <= point_volume(pair[1]))
        .map(|pair| (pair[0], pair[1]))
        .unwrap_or((first, last));
    let (lower_volume, upper_volume) = (point_volume(lower), point_volume(upper));
    let factor = (volume - lower_volume) / (upper_volume - lower_volume);
    let coefficient = lower.1 + (upper.1 - lower.1) * factor;
    volume / coefficient
}

/// Millilitres moved by `rotations`, rounded to 0.01 ml.
pub fn calculate_volume(rotations: f64) -> f64 {
    let first = CALIBRATION[0];
    let last = CALIBRATION[CALIBRATION.len() - 1];
    let coefficient = if rotations <= first.0 {
        first.1
    } else {
        CALIBRATION
            .windows(2)
            .find(|pair| pair[0].0 <= rotations && rotations < pair[1].0)
            .map(|pair| {
                let (lo, hi) = (pair[0], pair[1]);
                lo.1 + (rotations - lo.0) * (hi.1 - lo.1) / (hi.0 - lo.0)
            })
            .unwrap_or(last.1)
    };
    (rotations * coefficient * 100.0).round() / 100.0
}

pub struct Pump {
    core: DeviceCore,
    motor: Arc<dyn StepperMotor>,
    max_speed_rps: Mutex<f64>,
    registry: CommandRegistry<Pump>,
}

impl Pump {
    pub fn new(name: impl Into<String>, motor: Arc<dyn StepperMotor>, max_speed_rps: f64) -> Self {
        Self {
            core: DeviceCore::new(name),
            motor,
            max_speed_rps: Mutex::new(max_speed_rps),
            registry: CommandRegistry::new()
                .register_validated("run", &["forward", "rot_per_sec"], require_connected::<Pump>, run_cmd)
                .register_validated("pump", &["volume", "rot_per_sec"], require_connected::<Pump>, pump_cmd)
                .register("stop", &[], stop_cmd)
                .register_validated(
                    "set_profile",
                    &["max_speed_rps", "acceleration", "deceleration", "kval_hold", "kval_run"],
                    require_connected::<Pump>,
                    set_profile_cmd,
                ),
        }
    }

    pub fn max_speed_rps(&self) -> f64 {
        *lock(&self.max_speed_rps)
    }

    fn speed(&self, rot_per_sec: Option<f64>) -> DynResult<f64> {
        let speed = rot_per_sec.unwrap_or_else(|| self.max_speed_rps());
        if !(speed.is_finite() && speed > 0.0) {
            return Err(CommandError::InvalidArg {
                name: "rot_per_sec".to_string(),
                reason: format!("must be positive, got {speed}"),
            }
            .into());
        }
        Ok(speed)
    }

    /// Spin until stopped.
    pub async fn run(&self, forward: bool, rot_per_sec: Option<f64>) -> DynResult<()> {
        let speed = self.speed(rot_per_sec)?;
        self.set_state(DeviceState::Working);
        guarded(self, self.motor.run(forward, speed)).await
    }

    /// Start moving `volume` ml; negative volumes pump backwards.
    /// Returns the signed number of rotations requested.
    pub async fn pump(&self, volume: f64, rot_per_sec: Option<f64>) -> DynResult<f64> {
        let speed = self.speed(rot_per_sec)?;
        let mut rotations = calculate_rotations(volume.abs());
        if volume < 0.0 {
            rotations = -rotations;
        }
        if volume != 0.0 {
            self.set_state(DeviceState::Working);
            guarded(self, self.motor.move_by(rotations, speed)).await?;
        }
        Ok(rotations)
    }

    pub async fn stop(&self) -> DynResult<()> {
        guarded(self, self.motor.stop()).await?;
        self.set_state(DeviceState::Operational);
        Ok(())
    }

    pub async fn set_profile(&self, profile: MotorProfile) -> DynResult<()> {
        let max_speed = profile.max_speed_rps;
        guarded(self, self.motor.set_profile(profile)).await?;
        *lock(&self.max_speed_rps) = max_speed;
        Ok(())
    }

    /// Poll the motor. A failed read counts as an error, not as busy.
    pub async fn is_idle_or_error(&self) -> bool {
        if guarded(self, self.read_state()).await.is_err() {
            return true;
        }
        let state = self.state();
        state == DeviceState::Operational || state.is_error()
    }
}

fn run_cmd<'a>(pump: &'a Pump, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let forward = opt_bool(args, "forward")?.unwrap_or(true);
        pump.run(forward, opt_f64(args, "rot_per_sec")?).await?;
        Ok(Value::Null)
    })
}

fn pump_cmd<'a>(pump: &'a Pump, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let volume = arg_f64(args, "volume")?;
        let rotations = pump.pump(volume, opt_f64(args, "rot_per_sec")?).await?;
        Ok(json!({ "rotations": rotations }))
    })
}

fn stop_cmd<'a>(pump: &'a Pump, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        pump.stop().await?;
        Ok(Value::Null)
    })
}

fn set_profile_cmd<'a>(pump: &'a Pump, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let defaults = MotorProfile::default();
        let profile = MotorProfile {
            max_speed_rps: opt_f64(args, "max_speed_rps")?.unwrap_or(defaults.max_speed_rps),
            acceleration: opt_f64(args, "acceleration")?.unwrap_or(defaults.acceleration),
            deceleration: opt_f64(args, "deceleration")?.unwrap_or(defaults.deceleration),
            kval_hold: opt_f64(args, "kval_hold")?.unwrap_or(defaults.kval_hold),
            kval_run: opt_f64(args, "kval_run")?.unwrap_or(defaults.kval_run),
        };
        pump.set_profile(profile).await?;
        Ok(Value::Null)
    })
}

impl Device for Pump {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn reset_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move { self.stop().await })
    }

    fn read_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let state = match self.motor.status().await? {
                MotorStatus::Running => DeviceState::Working,
                MotorStatus::Stopped => DeviceState::Operational,
                MotorStatus::Fault => {
                    self.core().set_error("motor fault");
                    DeviceState::Error
                }
            };
            self.set_state(state);
            Ok(())
        })
    }

    fn probe(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            match self.motor.status().await? {
                MotorStatus::Fault => Err(format!("{}: motor reports a fault", self.id()).into()),
                _ => Ok(()),
            }
        })
    }

    fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        vec![self.motor.clone() as Arc<dyn Driver>]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_state_string(&self) -> String {
        match self.state() {
            DeviceState::Working => "Pumping".to_string(),
            other => other.label().to_string(),
        }
    }

    fn extra_data(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("max_speed_rps".to_string(), json!(self.max_speed_rps()));
        extra
    }

    fn commands_info(&self) -> CommandsInfo {
        self.registry.info()
    }

    fn execute<'a>(&'a self, command: &'a str, args: &'a CommandArgs) -> DeviceFuture<'a, Value> {
        self.registry.dispatch(self, command, args)
    }
}
