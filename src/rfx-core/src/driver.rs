// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Chip driver lifecycle and the capability contracts devices use.
//!
//! Devices hold one capability object per concern (PWM, stepper, ADC,
//! I/O pins, thermometer). The connection lifecycle only sees the
//! [`Driver`] supertrait.

use serde::{Deserialize, Serialize};

use crate::{BoxFuture, DynResult};

pub type DriverFuture<'a, T> = BoxFuture<'a, DynResult<T>>;

pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Configure the chip once the bridge is open.
    fn init(&self) -> DriverFuture<'_, ()>;

    /// Called after a reconnect, before `init`.
    fn reset(&self) -> DriverFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Called before the bridge is closed.
    fn terminate(&self) -> DriverFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

pub trait PwmOutput: Driver {
    /// Duty cycle in `[0, 1]`.
    fn set_duty_cycle(&self, channel: u8, duty: f64) -> DriverFuture<'_, ()>;

    fn duty_cycle(&self, channel: u8) -> DriverFuture<'_, f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorStatus {
    Stopped,
    Running,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorProfile {
    pub max_speed_rps: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    pub kval_hold: f64,
    pub kval_run: f64,
}

impl Default for MotorProfile {
    fn default() -> Self {
        Self {
            max_speed_rps: 1.0,
            acceleration: 5.0,
            deceleration: 5.0,
            kval_hold: 0.0,
            kval_run: 0.55,
        }
    }
}

pub trait StepperMotor: Driver {
    /// Spin continuously until stopped.
    fn run(&self, forward: bool, rot_per_sec: f64) -> DriverFuture<'_, ()>;

    /// Turn by a signed number of rotations.
    fn move_by(&self, rotations: f64, rot_per_sec: f64) -> DriverFuture<'_, ()>;

    fn stop(&self) -> DriverFuture<'_, ()>;

    fn status(&self) -> DriverFuture<'_, MotorStatus>;

    fn set_profile(&self, profile: MotorProfile) -> DriverFuture<'_, ()>;
}

pub trait AdcInput: Driver {
    fn read_millivolts(&self, channel: u8) -> DriverFuture<'_, f64>;
}

pub trait IoExpander: Driver {
    fn write_pin(&self, pin: u8, high: bool) -> DriverFuture<'_, ()>;

    fn read_pin(&self, pin: u8) -> DriverFuture<'_, bool>;
}

pub trait TemperatureSensor: Driver {
    fn measure_celsius(&self) -> DriverFuture<'_, f64>;
}
