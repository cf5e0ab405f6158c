// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Connection monitor: USB hot-plug events and link supervision.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use rfx_core::{DynResult, Event};

use crate::machine::Machine;
use crate::wait_for_shutdown;

pub async fn run_connection_monitor(machine: Arc<Machine>, shutdown_rx: watch::Receiver<bool>) {
    info!("Connection monitor started");
    let mut events = machine.services().events.subscribe();
    let mut tick = time::interval(machine.options().monitor_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let result = tokio::select! {
            _ = wait_for_shutdown(shutdown_rx.clone()) => break,
            event = events.recv() => match event {
                Ok(event) => handle_event(&machine, event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Connection monitor lagged, {} events skipped", n);
                    Ok(())
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tick.tick() => poll_link(&machine).await,
        };
        if let Err(e) = result {
            error!("Connection monitor error: {}", e);
            machine.services().events.fire(Event::Error {
                error: "connection monitor".to_string(),
                reason: e.to_string(),
            });
            if let Err(e) = machine.close(true).await {
                warn!("Error while closing after monitor failure: {}", e);
            }
        }
    }
    info!("Connection monitor stopped");
}

async fn handle_event(machine: &Machine, event: Event) -> DynResult<()> {
    match event {
        Event::UsbDetached { device } => machine.handle_usb_detached(&device).await,
        Event::UsbAttached { device } => match machine.handle_usb_attached(&device).await {
            Ok(()) => Ok(()),
            // the bridge may vanish again mid-connect; wait for the next attach
            Err(e) => {
                warn!("Reconnect to {} failed: {}", device.id, e);
                Ok(())
            }
        },
        _ => Ok(()),
    }
}

async fn poll_link(machine: &Machine) -> DynResult<()> {
    let changes = machine
        .services()
        .usb
        .refresh(machine.bridge().enumerate());
    if !changes.is_empty() {
        debug!(
            "USB changes: {} attached, {} detached",
            changes.attached.len(),
            changes.detached.len()
        );
    }
    machine.check_link().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{testing, ConnectionState};
    use rfx_backend::VirtualBridge;
    use rfx_core::DeviceState;

    #[tokio::test]
    async fn test_link_loss_closes_connection() {
        let (machine, _bridge) = testing::running().await;
        // bridge drops the session while the device stays enumerated
        machine.bridge().close().await.unwrap();
        testing::wait_until("disconnected", || {
            machine.connection_state() == ConnectionState::Disconnected
        })
        .await;
        assert_eq!(machine.state(), DeviceState::Closed);
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_while_reconnecting_connects() {
        let (machine, bridge) = testing::machine_with(testing::options());
        bridge.unplug(testing::SERIAL);
        machine.start();
        assert!(machine.connect().await.is_err());
        assert_eq!(machine.state(), DeviceState::Reconnecting);

        let mut events = machine.services().events.subscribe();
        bridge.plug(VirtualBridge::device_info(testing::SERIAL));
        testing::wait_until("operational after attach", || {
            machine.state() == DeviceState::Operational
        })
        .await;
        assert_eq!(machine.connection_state(), ConnectionState::Operational);

        let mut seen_attach = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::UsbAttached { .. }) {
                seen_attach = true;
            }
        }
        assert!(seen_attach);
        machine.shutdown().await;
    }
}
