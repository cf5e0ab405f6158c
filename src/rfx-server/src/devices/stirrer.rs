// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Magnetic stirrer fan on a PWM channel.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use rfx_core::device::{guarded, DeviceFuture};
use rfx_core::driver::{Driver, PwmOutput};
use rfx_core::registry::{CommandArgs, CommandError, CommandRegistry, CommandsInfo, HandlerFuture};
use rfx_core::sync::lock;
use rfx_core::{Device, DeviceCore, DeviceState, DynResult};

use super::require_connected;

pub const SLOW_DUTY_CYCLE: f64 = 0.0002;
pub const FAST_DUTY_CYCLE: f64 = 1.0;
const ACCELERATE_THRESHOLD: f64 = 0.2;
const ACCELERATION_DELAY: Duration = Duration::from_millis(100);

/// Requested speed: a preset level or a raw duty cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StirrerSpeed {
    /// 0 = off, 1 = slow, 2 = fast.
    Level(u8),
    Duty(f64),
}

impl StirrerSpeed {
    /// Integers select a level, fractional numbers a duty cycle.
    pub fn from_value(value: &Value) -> Result<Self, CommandError> {
        let invalid = |reason: String| CommandError::InvalidArg {
            name: "speed".to_string(),
            reason,
        };
        if let Some(level) = value.as_u64() {
            return u8::try_from(level)
                .map(Self::Level)
                .map_err(|_| invalid(format!("level {level} out of range")));
        }
        value
            .as_f64()
            .map(Self::Duty)
            .ok_or_else(|| invalid(format!("expected a number, got {value}")))
    }

    pub fn duty_cycle(self) -> Result<f64, CommandError> {
        match self {
            Self::Level(0) => Ok(0.0),
            Self::Level(1) => Ok(SLOW_DUTY_CYCLE),
            Self::Level(2) => Ok(FAST_DUTY_CYCLE),
            Self::Level(other) => Err(CommandError::InvalidArg {
                name: "speed".to_string(),
                reason: format!("level should be in [0, 1, 2], got {other}"),
            }),
            Self::Duty(duty) if duty > 1.0 => {
                warn!("Duty cycle {} above range [0.0, 1.0], using 1.0", duty);
                Ok(1.0)
            }
            Self::Duty(duty) if duty < 0.0 => {
                warn!("Duty cycle {} below range [0.0, 1.0], using 0.0", duty);
                Ok(0.0)
            }
            Self::Duty(duty) => Ok(duty),
        }
    }
}

pub struct Stirrer {
    core: DeviceCore,
    pwm: Arc<dyn PwmOutput>,
    channel: u8,
    speed: Mutex<f64>,
    registry: CommandRegistry<Stirrer>,
}

impl Stirrer {
    pub fn new(name: impl Into<String>, pwm: Arc<dyn PwmOutput>, channel: u8) -> Self {
        Self {
            core: DeviceCore::new(name),
            pwm,
            channel,
            speed: Mutex::new(0.0),
            registry: CommandRegistry::new()
                .register_validated("set_speed", &["speed"], require_connected::<Stirrer>, set_speed_cmd)
                .register("stop", &[], stop_cmd),
        }
    }

    pub fn speed(&self) -> f64 {
        *lock(&self.speed)
    }

    /// Returns the duty cycle finally applied. Slow speeds start with a
    /// short full-speed kick so the stir bar couples.
    pub async fn set_speed(&self, speed: StirrerSpeed) -> DynResult<f64> {
        let duty = speed.duty_cycle()?;
        if duty > 0.0 && duty < ACCELERATE_THRESHOLD {
            debug!("{}: accelerating before duty {}", self.id(), duty);
            self.apply(FAST_DUTY_CYCLE).await?;
            tokio::time::sleep(ACCELERATION_DELAY).await;
        }
        self.apply(duty).await?;
        Ok(duty)
    }

    pub async fn stop(&self) -> DynResult<()> {
        self.apply(0.0).await
    }

    async fn apply(&self, duty: f64) -> DynResult<()> {
        guarded(self, self.pwm.set_duty_cycle(self.channel, duty)).await?;
        *lock(&self.speed) = duty;
        self.set_state(DeviceState::Operational);
        Ok(())
    }
}

fn set_speed_cmd<'a>(stirrer: &'a Stirrer, args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        let value = args
            .get("speed")
            .ok_or_else(|| CommandError::MissingArg("speed".to_string()))?;
        let duty = stirrer.set_speed(StirrerSpeed::from_value(value)?).await?;
        Ok(json!(duty))
    })
}

fn stop_cmd<'a>(stirrer: &'a Stirrer, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        stirrer.stop().await?;
        Ok(Value::Null)
    })
}

impl Device for Stirrer {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn reset_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.set_speed(StirrerSpeed::Duty(self.speed())).await?;
            Ok(())
        })
    }

    fn read_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let duty = self.pwm.duty_cycle(self.channel).await?;
            *lock(&self.speed) = duty;
            self.set_state(DeviceState::Operational);
            Ok(())
        })
    }

    fn probe(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.pwm.duty_cycle(self.channel).await?;
            Ok(())
        })
    }

    fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        vec![self.pwm.clone() as Arc<dyn Driver>]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_state_string(&self) -> String {
        match self.state() {
            DeviceState::Operational if self.speed() > 0.0 => "Stirring".to_string(),
            DeviceState::Operational => "Stopped".to_string(),
            other => other.label().to_string(),
        }
    }

    fn extra_data(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("speed".to_string(), json!(self.speed()));
        extra
    }

    fn commands_info(&self) -> CommandsInfo {
        self.registry.info()
    }

    fn execute<'a>(&'a self, command: &'a str, args: &'a CommandArgs) -> DeviceFuture<'a, Value> {
        self.registry.dispatch(self, command, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::TestBoard;
    use rfx_backend::BoardLayout;

    #[test]
    fn test_speed_parsing() {
        assert_eq!(StirrerSpeed::from_value(&json!(2)).unwrap(), StirrerSpeed::Level(2));
        assert_eq!(StirrerSpeed::from_value(&json!(0.5)).unwrap(), StirrerSpeed::Duty(0.5));
        assert!(StirrerSpeed::from_value(&json!("fast")).is_err());
    }

    #[test]
    fn test_levels_and_clamping() {
        assert_eq!(StirrerSpeed::Level(0).duty_cycle().unwrap(), 0.0);
        assert_eq!(StirrerSpeed::Level(1).duty_cycle().unwrap(), SLOW_DUTY_CYCLE);
        assert_eq!(StirrerSpeed::Level(2).duty_cycle().unwrap(), FAST_DUTY_CYCLE);
        assert!(StirrerSpeed::Level(3).duty_cycle().is_err());
        assert_eq!(StirrerSpeed::Duty(1.7).duty_cycle().unwrap(), 1.0);
        assert_eq!(StirrerSpeed::Duty(-0.1).duty_cycle().unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_slow_speed_accelerates_first() {
        let board = TestBoard::connected().await;
        let stirrer = Stirrer::new("Stirrer 1", board.board.pwm_output(), BoardLayout::stirrer_channel(1));
        stirrer.connect().await.unwrap();
        assert_eq!(stirrer.get_state_string(), "Stopped");

        let started = tokio::time::Instant::now();
        let duty = stirrer.set_speed(StirrerSpeed::Level(1)).await.unwrap();
        assert!(started.elapsed() >= ACCELERATION_DELAY);
        assert_eq!(duty, SLOW_DUTY_CYCLE);
        assert_eq!(stirrer.get_state_string(), "Stirring");

        let applied = board.board.pwm.duty_cycle(BoardLayout::stirrer_channel(1)).await.unwrap();
        assert!((applied - SLOW_DUTY_CYCLE).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_fast_speed_skips_acceleration() {
        let board = TestBoard::connected().await;
        let stirrer = Stirrer::new("Stirrer 2", board.board.pwm_output(), BoardLayout::stirrer_channel(2));
        stirrer.connect().await.unwrap();
        let args = json!({"speed": 0.8}).as_object().cloned().unwrap();
        let started = tokio::time::Instant::now();
        stirrer.execute("set_speed", &args).await.unwrap();
        assert!(started.elapsed() < ACCELERATION_DELAY);
        assert!((stirrer.speed() - 0.8).abs() < 1e-9);
    }
}
