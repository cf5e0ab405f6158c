// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! USB bridge and bus port contracts.
//!
//! One bridge chip multiplexes an SPI bus and an I2C bus. Every port
//! transaction runs under the bridge's [`BusSession`], so at most one
//! register transfer is in flight per process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::{BoxFuture, DynResult};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("{port}: not acknowledged (NACK)")]
    Nack { port: String },
    #[error("{port}: bridge is not connected")]
    Disconnected { port: String },
    #[error("{port}: {message}")]
    Io { port: String, message: String },
}

pub type PortFuture<'a, T> = BoxFuture<'a, Result<T, PortError>>;

/// Register-level access to one chip behind the bridge.
pub trait HardwarePort: Send + Sync {
    fn name(&self) -> &str;

    fn read(&self, len: usize) -> PortFuture<'_, Vec<u8>>;

    fn write<'a>(&'a self, data: &'a [u8]) -> PortFuture<'a, ()>;

    fn read_from(&self, register: u8, len: usize) -> PortFuture<'_, Vec<u8>>;

    fn write_to<'a>(&'a self, register: u8, data: &'a [u8]) -> PortFuture<'a, ()>;

    /// Write then read within one session.
    fn exchange<'a>(&'a self, out: &'a [u8], read_len: usize) -> PortFuture<'a, Vec<u8>>;
}

/// Exclusive access to the physical bridge.
#[derive(Debug, Default)]
pub struct BusSession {
    lock: Mutex<()>,
}

impl BusSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Spi,
    I2c,
}

/// Descriptor of an attached bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl UsbDeviceInfo {
    /// `None` matches any device.
    pub fn matches_serial(&self, serial: Option<&str>) -> bool {
        match serial {
            None => true,
            Some(serial) => self.serial_number.as_deref() == Some(serial),
        }
    }
}

/// USB bridge exposing the shared buses.
pub trait Bridge: Send + Sync {
    fn name(&self) -> &str;

    fn open<'a>(&'a self, device: &'a UsbDeviceInfo) -> BoxFuture<'a, DynResult<()>>;

    fn close(&self) -> BoxFuture<'_, DynResult<()>>;

    fn is_connected(&self) -> bool;

    /// Device currently opened, if any.
    fn device(&self) -> Option<UsbDeviceInfo>;

    fn session(&self) -> Arc<BusSession>;

    /// Port for a chip select (SPI) or address (I2C). Ports can be taken
    /// before the bridge is opened; transfers fail until it is.
    fn port(&self, bus: BusKind, address: u8) -> Arc<dyn HardwarePort>;

    /// Bridges currently visible on the host.
    fn enumerate(&self) -> Vec<UsbDeviceInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(serial: Option<&str>) -> UsbDeviceInfo {
        UsbDeviceInfo {
            id: "usb-1-4".to_string(),
            vendor_id: 0x0403,
            product_id: 0x6014,
            serial_number: serial.map(str::to_string),
            manufacturer: None,
            product: None,
        }
    }

    #[test]
    fn test_matches_serial() {
        assert!(info(Some("RF01")).matches_serial(None));
        assert!(info(Some("RF01")).matches_serial(Some("RF01")));
        assert!(!info(Some("RF01")).matches_serial(Some("RF02")));
        assert!(!info(None).matches_serial(Some("RF01")));
    }

    #[test]
    fn test_port_error_messages() {
        let err = PortError::Nack {
            port: "i2c:0x48".to_string(),
        };
        assert_eq!(err.to_string(), "i2c:0x48: not acknowledged (NACK)");
    }
}
