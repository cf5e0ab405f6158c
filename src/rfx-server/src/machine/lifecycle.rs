// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! USB connection lifecycle: connect cascade, teardown and hot-plug.

use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use rfx_core::sync::lock;
use rfx_core::transport::UsbDeviceInfo;
use rfx_core::{DeviceState, DynResult, Event};

use super::Machine;
use crate::error::MachineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Operational,
    Reconnecting,
}

impl Machine {
    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.connection)
    }

    fn set_connection(&self, new: ConnectionState) {
        let old = std::mem::replace(&mut *lock(&self.connection), new);
        if old != new {
            debug!("Connection: {:?} -> {:?}", old, new);
        }
    }

    /// Bridge currently in use, if connected.
    pub fn usb_device(&self) -> Option<UsbDeviceInfo> {
        lock(&self.usb_device).clone()
    }

    fn wanted_serial(&self) -> Option<String> {
        self.options
            .serial_number
            .clone()
            .or_else(|| self.usb_device().and_then(|d| d.serial_number))
    }

    /// Open the bridge, initialize every driver, then connect every
    /// device in registration order. A no-op when already connected.
    pub async fn connect(&self) -> DynResult<()> {
        let _connecting = self.connect_lock.lock().await;
        let previous = self.connection_state();
        if previous == ConnectionState::Operational {
            debug!("Already connected");
            return Ok(());
        }
        let reconnecting = previous == ConnectionState::Reconnecting;
        self.closing.store(false, Ordering::SeqCst);
        self.set_connection(ConnectionState::Connecting);
        self.set_state(DeviceState::FindingDevice);
        self.services.events.fire(Event::MachineConnecting);

        let serial = self.wanted_serial();
        self.services.usb.refresh(self.bridge.enumerate());
        let Some(device) = self.services.usb.find(serial.as_deref()) else {
            let serial = serial.unwrap_or_else(|| "any".to_string());
            if self.options.reconnect {
                info!("No bridge found (serial: {}), waiting for it to be attached", serial);
                self.set_connection(ConnectionState::Reconnecting);
                self.set_state(DeviceState::Reconnecting);
            } else {
                self.set_connection(ConnectionState::Disconnected);
                self.set_state(DeviceState::Offline);
            }
            return Err(MachineError::NoUsbDevice(serial).into());
        };

        self.set_state(DeviceState::Connecting);
        if let Err(e) = self.bridge.open(&device).await {
            return Err(self.abort_connect(format!("Failed to open {}: {}", device.id, e)).await);
        }
        *lock(&self.usb_device) = Some(device.clone());

        let drivers = self.board.drivers();
        if reconnecting {
            for driver in &drivers {
                if let Err(e) = driver.reset().await {
                    warn!("{}: reset failed: {}", driver.name(), e);
                }
            }
        }
        for driver in &drivers {
            if let Err(e) = driver.init().await {
                return Err(self
                    .abort_connect(format!("{}: init failed: {}", driver.name(), e))
                    .await);
            }
        }
        for device in &self.devices {
            if let Err(e) = device.connect().await {
                warn!("{}: connect failed: {}", device.id(), e);
            }
        }

        self.set_error("");
        self.set_connection(ConnectionState::Operational);
        self.set_state(DeviceState::Operational);
        self.services.events.fire(Event::MachineConnected);
        info!("Connected to {} ({:?})", device.id, device.serial_number);
        for _ in 0..self.options.ack_max.max(1) {
            self.clear_to_send.set();
        }
        self.continue_sending();
        Ok(())
    }

    async fn abort_connect(&self, message: String) -> Box<dyn std::error::Error + Send + Sync> {
        error!("{}", message);
        if let Err(e) = self.bridge.close().await {
            warn!("Failed to close bridge: {}", e);
        }
        self.set_error(message.clone());
        self.set_connection(ConnectionState::Disconnected);
        self.set_state(DeviceState::Error);
        self.services.events.fire(Event::Error {
            error: "connect".to_string(),
            reason: message.clone(),
        });
        message.into()
    }

    /// Tear the connection down. Concurrent calls collapse into one;
    /// the state always ends in `Closed` or `ClosedWithError`.
    pub async fn close(&self, is_error: bool) -> DynResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("Close already in progress");
            return Ok(());
        }
        info!("Closing connection{}", if is_error { " after error" } else { "" });
        self.clear_to_send.reset();
        if is_error {
            self.escalate_working_devices();
        }
        let result = self.terminate_connection().await;
        self.set_connection(ConnectionState::Disconnected);
        *lock(&self.usb_device) = None;
        let state = if is_error || result.is_err() {
            DeviceState::ClosedWithError
        } else {
            DeviceState::Closed
        };
        if let Err(e) = &result {
            self.set_error(e.to_string());
        }
        self.set_state(state);
        self.services.events.fire(Event::MachineDisconnected);
        result
    }

    async fn terminate_connection(&self) -> DynResult<()> {
        for device in &self.devices {
            device.disconnect().await?;
        }
        let mut first_error = None;
        for driver in self.board.drivers() {
            if let Err(e) = driver.terminate().await {
                warn!("{}: terminate failed: {}", driver.name(), e);
                first_error.get_or_insert(e);
            }
        }
        self.bridge.close().await?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Devices caught mid-operation must not fall back to idle.
    fn escalate_working_devices(&self) {
        for device in &self.devices {
            if device.state().is_working() {
                device.core().set_error("connection lost while working");
                device.set_state(DeviceState::ClosedWithError);
            }
        }
    }

    /// A bridge disappeared from the host.
    pub async fn handle_usb_detached(&self, device: &UsbDeviceInfo) -> DynResult<()> {
        let ours = self.usb_device().is_some_and(|d| d.id == device.id);
        if !ours || self.connection_state() != ConnectionState::Operational {
            return Ok(());
        }
        let working = self.state().is_working();
        warn!("Bridge {} removed{}", device.id, if working { " while working" } else { "" });
        if !self.options.reconnect {
            return self.close(working).await;
        }
        self.clear_to_send.reset();
        self.set_connection(ConnectionState::Reconnecting);
        self.escalate_working_devices();
        if working {
            self.set_error("bridge removed while working");
        }
        if let Err(e) = self.bridge.close().await {
            debug!("Closing removed bridge: {}", e);
        }
        self.set_state(DeviceState::Reconnecting);
        self.services.events.fire(Event::MachineDisconnected);
        Ok(())
    }

    /// A bridge appeared; resume if it is the one being waited for.
    pub async fn handle_usb_attached(&self, device: &UsbDeviceInfo) -> DynResult<()> {
        if self.connection_state() != ConnectionState::Reconnecting {
            return Ok(());
        }
        if !device.matches_serial(self.wanted_serial().as_deref()) {
            debug!("Ignoring bridge {} (serial {:?})", device.id, device.serial_number);
            return Ok(());
        }
        info!("Bridge {} is back, reconnecting", device.id);
        self.connect().await
    }

    /// Close when the bridge dropped the link although its device is
    /// still enumerated.
    pub async fn check_link(&self) -> DynResult<()> {
        if self.connection_state() != ConnectionState::Operational || self.bridge.is_connected() {
            return Ok(());
        }
        let still_visible = self
            .usb_device()
            .is_some_and(|ours| self.services.usb.devices().iter().any(|d| d.id == ours.id));
        if still_visible {
            warn!("Bridge link lost");
            return self.close(self.state().is_working()).await;
        }
        Ok(())
    }
}
