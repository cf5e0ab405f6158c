// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Register-mapped reference drivers.
//!
//! Each driver talks to its chip through a [`HardwarePort`] using a
//! small fixed register map. They implement the capability traits the
//! devices consume and count lifecycle calls for diagnostics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use rfx_core::driver::{
    AdcInput, Driver, DriverFuture, IoExpander, MotorProfile, MotorStatus, PwmOutput, StepperMotor,
    TemperatureSensor,
};
use rfx_core::sync::lock;
use rfx_core::transport::HardwarePort;

pub const REG_CONFIG: u8 = 0xF0;
pub const REG_STATUS: u8 = 0xF1;
pub const REG_COMMAND: u8 = 0xF2;
pub const REG_PROFILE: u8 = 0xF3;
pub const REG_OUTPUT: u8 = 0x00;

pub const STATUS_FAULT: u8 = 0x80;

const CMD_STOP: u8 = 0x00;
const CMD_RUN: u8 = 0x01;
const CMD_MOVE: u8 = 0x02;

fn check_len(port: &dyn HardwarePort, bytes: &[u8], expected: usize) -> Result<(), String> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(format!(
            "{}: short read ({} of {} bytes)",
            port.name(),
            bytes.len(),
            expected
        ))
    }
}

/// Lifecycle bookkeeping shared by all drivers here.
#[derive(Debug, Default)]
struct Lifecycle {
    inits: AtomicUsize,
    resets: AtomicUsize,
    terminations: AtomicUsize,
}

macro_rules! lifecycle_accessors {
    ($ty:ty) => {
        impl $ty {
            pub fn init_count(&self) -> usize {
                self.lifecycle.inits.load(Ordering::SeqCst)
            }

            pub fn reset_count(&self) -> usize {
                self.lifecycle.resets.load(Ordering::SeqCst)
            }

            pub fn terminate_count(&self) -> usize {
                self.lifecycle.terminations.load(Ordering::SeqCst)
            }
        }
    };
}

/// PWM outputs; each channel register holds a big-endian 16 bit duty.
pub struct RegisterPwm {
    name: String,
    port: Arc<dyn HardwarePort>,
    lifecycle: Lifecycle,
}

impl RegisterPwm {
    pub fn new(name: impl Into<String>, port: Arc<dyn HardwarePort>) -> Self {
        Self {
            name: name.into(),
            port,
            lifecycle: Lifecycle::default(),
        }
    }
}

lifecycle_accessors!(RegisterPwm);

impl Driver for RegisterPwm {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.inits.fetch_add(1, Ordering::SeqCst);
            self.port.write_to(REG_CONFIG, &[0x01]).await?;
            Ok(())
        })
    }

    fn reset(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn terminate(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.terminations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl PwmOutput for RegisterPwm {
    fn set_duty_cycle(&self, channel: u8, duty: f64) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let raw = (duty.clamp(0.0, 1.0) * f64::from(u16::MAX)).round() as u16;
            self.port.write_to(channel, &raw.to_be_bytes()).await?;
            debug!("{}: channel {} duty {:.4}", self.name, channel, duty);
            Ok(())
        })
    }

    fn duty_cycle(&self, channel: u8) -> DriverFuture<'_, f64> {
        Box::pin(async move {
            let bytes = self.port.read_from(channel, 2).await?;
            check_len(self.port.as_ref(), &bytes, 2)?;
            let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
            Ok(f64::from(raw) / f64::from(u16::MAX))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Motion {
    Idle,
    Continuous,
    Until(Instant),
}

/// Stepper controller. Motion is tracked on the host side, the chip
/// only reports faults through its status register.
pub struct RegisterStepper {
    name: String,
    port: Arc<dyn HardwarePort>,
    motion: Mutex<Motion>,
    profile: Mutex<MotorProfile>,
    lifecycle: Lifecycle,
}

impl RegisterStepper {
    pub fn new(name: impl Into<String>, port: Arc<dyn HardwarePort>) -> Self {
        Self {
            name: name.into(),
            port,
            motion: Mutex::new(Motion::Idle),
            profile: Mutex::new(MotorProfile::default()),
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn profile(&self) -> MotorProfile {
        lock(&self.profile).clone()
    }

    fn speed_bytes(rot_per_sec: f64) -> [u8; 4] {
        (rot_per_sec as f32).to_be_bytes()
    }
}

lifecycle_accessors!(RegisterStepper);

impl Driver for RegisterStepper {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.inits.fetch_add(1, Ordering::SeqCst);
            let profile = self.profile();
            self.port.write_to(REG_CONFIG, &[0x01]).await?;
            self.port
                .write_to(REG_PROFILE, &Self::speed_bytes(profile.max_speed_rps))
                .await?;
            Ok(())
        })
    }

    fn reset(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.resets.fetch_add(1, Ordering::SeqCst);
            *lock(&self.motion) = Motion::Idle;
            Ok(())
        })
    }

    fn terminate(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.terminations.fetch_add(1, Ordering::SeqCst);
            *lock(&self.motion) = Motion::Idle;
            // Best effort: the bridge may already be gone.
            let _ = self.port.write_to(REG_COMMAND, &[CMD_STOP]).await;
            Ok(())
        })
    }
}

impl StepperMotor for RegisterStepper {
    fn run(&self, forward: bool, rot_per_sec: f64) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let speed = Self::speed_bytes(rot_per_sec);
            let frame = [CMD_RUN, u8::from(forward), speed[0], speed[1], speed[2], speed[3]];
            self.port.write_to(REG_COMMAND, &frame).await?;
            *lock(&self.motion) = Motion::Continuous;
            Ok(())
        })
    }

    fn move_by(&self, rotations: f64, rot_per_sec: f64) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            if rot_per_sec <= 0.0 {
                return Err(format!("{}: speed must be positive, got {}", self.name, rot_per_sec).into());
            }
            let steps = (rotations as f32).to_be_bytes();
            let speed = Self::speed_bytes(rot_per_sec);
            let frame = [
                CMD_MOVE, steps[0], steps[1], steps[2], steps[3], speed[0], speed[1], speed[2], speed[3],
            ];
            self.port.write_to(REG_COMMAND, &frame).await?;
            let duration = Duration::from_secs_f64(rotations.abs() / rot_per_sec);
            *lock(&self.motion) = Motion::Until(Instant::now() + duration);
            Ok(())
        })
    }

    fn stop(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.port.write_to(REG_COMMAND, &[CMD_STOP]).await?;
            *lock(&self.motion) = Motion::Idle;
            Ok(())
        })
    }

    fn status(&self) -> DriverFuture<'_, MotorStatus> {
        Box::pin(async move {
            let bytes = self.port.read_from(REG_STATUS, 1).await?;
            check_len(self.port.as_ref(), &bytes, 1)?;
            if bytes[0] & STATUS_FAULT != 0 {
                return Ok(MotorStatus::Fault);
            }
            let mut motion = lock(&self.motion);
            let status = match *motion {
                Motion::Idle => MotorStatus::Stopped,
                Motion::Continuous => MotorStatus::Running,
                Motion::Until(deadline) if Instant::now() < deadline => MotorStatus::Running,
                Motion::Until(_) => {
                    *motion = Motion::Idle;
                    MotorStatus::Stopped
                }
            };
            Ok(status)
        })
    }

    fn set_profile(&self, profile: MotorProfile) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.port
                .write_to(REG_PROFILE, &Self::speed_bytes(profile.max_speed_rps))
                .await?;
            *lock(&self.profile) = profile;
            Ok(())
        })
    }
}

/// ADC; each channel register holds a big-endian `f32` in millivolts.
pub struct RegisterAdc {
    name: String,
    port: Arc<dyn HardwarePort>,
    lifecycle: Lifecycle,
}

impl RegisterAdc {
    pub fn new(name: impl Into<String>, port: Arc<dyn HardwarePort>) -> Self {
        Self {
            name: name.into(),
            port,
            lifecycle: Lifecycle::default(),
        }
    }
}

lifecycle_accessors!(RegisterAdc);

impl Driver for RegisterAdc {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.inits.fetch_add(1, Ordering::SeqCst);
            self.port.write_to(REG_CONFIG, &[0x01]).await?;
            Ok(())
        })
    }
}

impl AdcInput for RegisterAdc {
    fn read_millivolts(&self, channel: u8) -> DriverFuture<'_, f64> {
        Box::pin(async move {
            let bytes = self.port.read_from(channel, 4).await?;
            check_len(self.port.as_ref(), &bytes, 4)?;
            Ok(f64::from(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
        })
    }
}

/// 16 pin output expander; register 0 holds the pin levels.
pub struct RegisterIo {
    name: String,
    port: Arc<dyn HardwarePort>,
    lifecycle: Lifecycle,
}

impl RegisterIo {
    pub fn new(name: impl Into<String>, port: Arc<dyn HardwarePort>) -> Self {
        Self {
            name: name.into(),
            port,
            lifecycle: Lifecycle::default(),
        }
    }

    async fn levels(&self) -> Result<u16, String> {
        let bytes = self
            .port
            .read_from(REG_OUTPUT, 2)
            .await
            .map_err(|e| e.to_string())?;
        check_len(self.port.as_ref(), &bytes, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

lifecycle_accessors!(RegisterIo);

impl Driver for RegisterIo {
    fn name(&self) -> &str {
        &self.name
    }

    /// All pins high.
    fn init(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.inits.fetch_add(1, Ordering::SeqCst);
            self.port.write_to(REG_OUTPUT, &u16::MAX.to_be_bytes()).await?;
            Ok(())
        })
    }
}

impl IoExpander for RegisterIo {
    fn write_pin(&self, pin: u8, high: bool) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            if pin >= 16 {
                return Err(format!("{}: pin {} out of range", self.name, pin).into());
            }
            let levels = self.levels().await?;
            let levels = if high {
                levels | (1 << pin)
            } else {
                levels & !(1 << pin)
            };
            self.port.write_to(REG_OUTPUT, &levels.to_be_bytes()).await?;
            Ok(())
        })
    }

    fn read_pin(&self, pin: u8) -> DriverFuture<'_, bool> {
        Box::pin(async move {
            if pin >= 16 {
                return Err(format!("{}: pin {} out of range", self.name, pin).into());
            }
            Ok(self.levels().await? & (1 << pin) != 0)
        })
    }
}

/// Thermometer; register 0 holds a big-endian `i16` in 1/16 °C.
pub struct RegisterThermometer {
    name: String,
    port: Arc<dyn HardwarePort>,
    lifecycle: Lifecycle,
}

impl RegisterThermometer {
    pub fn new(name: impl Into<String>, port: Arc<dyn HardwarePort>) -> Self {
        Self {
            name: name.into(),
            port,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn encode(celsius: f64) -> [u8; 2] {
        ((celsius * 16.0).round() as i16).to_be_bytes()
    }
}

lifecycle_accessors!(RegisterThermometer);

impl Driver for RegisterThermometer {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.lifecycle.inits.fetch_add(1, Ordering::SeqCst);
            self.port.write_to(REG_CONFIG, &[0x01]).await?;
            Ok(())
        })
    }
}

impl TemperatureSensor for RegisterThermometer {
    fn measure_celsius(&self) -> DriverFuture<'_, f64> {
        Box::pin(async move {
            let bytes = self.port.read_from(REG_OUTPUT, 2).await?;
            check_len(self.port.as_ref(), &bytes, 2)?;
            Ok(f64::from(i16::from_be_bytes([bytes[0], bytes[1]])) / 16.0)
        })
    }
}
