// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Pinch valve on a servo PWM channel.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};

use rfx_core::device::{guarded, DeviceFuture};
use rfx_core::driver::{Driver, PwmOutput};
use rfx_core::registry::{CommandArgs, CommandRegistry, CommandsInfo, HandlerFuture};
use rfx_core::sync::lock;
use rfx_core::{Device, DeviceCore, DeviceState, DynResult};

use super::require_connected;

pub const OPEN_DUTY_CYCLE: f64 = 0.03;
pub const CLOSED_DUTY_CYCLE: f64 = 0.12;
const DUTY_TOLERANCE: f64 = 5e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValvePosition {
    Open,
    Closed,
    Between,
    Unknown,
}

impl ValvePosition {
    pub fn label(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Between => "Between",
            Self::Unknown => "Unknown",
        }
    }
}

fn duty_matches(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() <= DUTY_TOLERANCE * actual.abs().max(expected.abs())
}

pub struct Valve {
    core: DeviceCore,
    pwm: Arc<dyn PwmOutput>,
    channel: u8,
    settle: Duration,
    position: Mutex<ValvePosition>,
    target: Mutex<ValvePosition>,
    registry: CommandRegistry<Valve>,
}

impl Valve {
    pub fn new(name: impl Into<String>, pwm: Arc<dyn PwmOutput>, channel: u8, settle: Duration) -> Self {
        Self {
            core: DeviceCore::new(name),
            pwm,
            channel,
            settle,
            position: Mutex::new(ValvePosition::Unknown),
            target: Mutex::new(ValvePosition::Closed),
            registry: CommandRegistry::new()
                .register_validated("open", &[], require_connected::<Valve>, open_cmd)
                .register_validated("close", &[], require_connected::<Valve>, close_cmd),
        }
    }

    pub fn position(&self) -> ValvePosition {
        *lock(&self.position)
    }

    pub fn is_open(&self) -> bool {
        self.position() == ValvePosition::Open
    }

    pub async fn open(&self) -> DynResult<()> {
        self.move_to(ValvePosition::Open).await
    }

    pub async fn close(&self) -> DynResult<()> {
        self.move_to(ValvePosition::Closed).await
    }

    /// Drive the servo and wait for it to settle, so the reported
    /// position matches the actuator once this returns.
    async fn move_to(&self, target: ValvePosition) -> DynResult<()> {
        let duty = if target == ValvePosition::Open {
            OPEN_DUTY_CYCLE
        } else {
            CLOSED_DUTY_CYCLE
        };
        *lock(&self.target) = target;
        self.set_state(DeviceState::Working);
        guarded(self, self.pwm.set_duty_cycle(self.channel, duty)).await?;
        tokio::time::sleep(self.settle).await;
        *lock(&self.position) = target;
        self.set_state(DeviceState::Operational);
        Ok(())
    }
}

fn open_cmd<'a>(valve: &'a Valve, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        valve.open().await?;
        Ok(json!(valve.position()))
    })
}

fn close_cmd<'a>(valve: &'a Valve, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move {
        valve.close().await?;
        Ok(json!(valve.position()))
    })
}

impl Device for Valve {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn reset_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let target = *lock(&self.target);
            self.move_to(target).await
        })
    }

    fn read_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let duty = self.pwm.duty_cycle(self.channel).await?;
            let position = if duty_matches(duty, OPEN_DUTY_CYCLE) {
                ValvePosition::Open
            } else if duty_matches(duty, CLOSED_DUTY_CYCLE) {
                ValvePosition::Closed
            } else {
                ValvePosition::Between
            };
            *lock(&self.position) = position;
            self.set_state(DeviceState::Operational);
            Ok(())
        })
    }

    fn probe(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.open().await?;
            self.close().await
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
            DeviceState::Working if *lock(&self.target) == ValvePosition::Open => "Opening".to_string(),
            DeviceState::Working => "Closing".to_string(),
            DeviceState::Operational => self.position().label().to_string(),
            other => other.label().to_string(),
        }
    }

    fn extra_data(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("position".to_string(), json!(self.position()));
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
    use rfx_core::transport::BusKind;

    const SETTLE: Duration = Duration::from_millis(20);

    fn valve(board: &TestBoard, vial: u8) -> Valve {
        Valve::new(
            format!("Valve {vial}"),
            board.board.pwm_output(),
            BoardLayout::valve_channel(vial),
            SETTLE,
        )
    }

    #[test]
    fn test_duty_tolerance() {
        assert!(duty_matches(0.0301, OPEN_DUTY_CYCLE));
        assert!(!duty_matches(0.031, OPEN_DUTY_CYCLE));
        assert!(duty_matches(0.12, CLOSED_DUTY_CYCLE));
    }

    #[tokio::test]
    async fn test_open_reports_position_after_settle() {
        let board = TestBoard::connected().await;
        let valve = valve(&board, 3);
        valve.connect().await.unwrap();
        assert_eq!(valve.position(), ValvePosition::Closed);
        assert_eq!(valve.get_state_string(), "Closed");

        valve.open().await.unwrap();
        assert!(valve.is_open());
        assert_eq!(valve.state(), DeviceState::Operational);
        assert_eq!(valve.get_data().extra["position"], "open");
    }

    #[tokio::test]
    async fn test_read_state_detects_between() {
        let board = TestBoard::connected().await;
        let valve = valve(&board, 1);
        board.board.pwm.set_duty_cycle(0, 0.5).await.unwrap();
        valve.read_state().await.unwrap();
        assert_eq!(valve.position(), ValvePosition::Between);
    }

    #[tokio::test]
    async fn test_nack_demotes_to_error() {
        let board = TestBoard::connected().await;
        let valve = valve(&board, 2);
        valve.connect().await.unwrap();
        board
            .bridge
            .set_nack(BusKind::I2c, rfx_backend::board::PWM_ADDRESS, true);
        assert!(valve.execute("open", &CommandArgs::new()).await.is_err());
        assert_eq!(valve.state(), DeviceState::Error);
        assert_eq!(valve.error(), "i2c:0x40: not acknowledged (NACK)");
    }

    #[tokio::test]
    async fn test_commands_info() {
        let board = TestBoard::connected().await;
        let valve = valve(&board, 1);
        let info = valve.commands_info();
        assert!(info.contains_key("open"));
        assert!(info.contains_key("close"));
    }
}
