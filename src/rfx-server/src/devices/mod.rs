// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Concrete bioreactor devices.
//!
//! Each device holds the capability drivers it needs and registers its
//! named commands in a [`rfx_core::CommandRegistry`] at construction.

mod od_sensor;
mod pump;
mod stirrer;
mod thermometer;
mod valve;
mod vial;

pub use od_sensor::{LogisticCurve, OdSensor};
pub use pump::{Pump, PumpRole};
pub use stirrer::{Stirrer, StirrerSpeed};
pub use thermometer::Thermometer;
pub use valve::{Valve, ValvePosition};
pub use vial::Vial;

use rfx_core::registry::{CommandArgs, ValidationResult};
use rfx_core::{Device, DeviceState};

/// Reject commands while the device has no live connection.
pub fn require_connected<D: Device>(device: &D, _args: &CommandArgs) -> ValidationResult {
    match device.state() {
        DeviceState::Offline
        | DeviceState::FindingDevice
        | DeviceState::Connecting
        | DeviceState::Closed
        | DeviceState::ClosedWithError
        | DeviceState::Reconnecting => ValidationResult::InvalidState(format!(
            "{} is {}",
            device.id(),
            device.state().label()
        )),
        _ => ValidationResult::Ok,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use rfx_backend::{Board, BoardLayout, VirtualBridge};
    use rfx_core::transport::Bridge;

    pub const SERIAL: &str = "RFX-TEST-1";

    /// Virtual bridge opened and every board driver initialized.
    pub struct TestBoard {
        pub bridge: Arc<VirtualBridge>,
        pub board: Board,
    }

    impl TestBoard {
        pub async fn connected() -> Self {
            let layout = BoardLayout::default();
            let bridge = Arc::new(VirtualBridge::with_serial(SERIAL));
            bridge.seed_board(&layout);
            bridge
                .open(&VirtualBridge::device_info(SERIAL))
                .await
                .unwrap();
            let board = Board::build(bridge.clone(), &layout);
            for driver in board.drivers() {
                driver.init().await.unwrap();
            }
            Self { bridge, board }
        }
    }
}
