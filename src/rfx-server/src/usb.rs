// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Tracks which bridges are plugged in.

use std::sync::Mutex;

use tracing::info;

use rfx_core::sync::lock;
use rfx_core::transport::UsbDeviceInfo;
use rfx_core::{Event, EventBus};

/// Result of comparing a fresh enumeration with the known set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsbChanges {
    pub attached: Vec<UsbDeviceInfo>,
    pub detached: Vec<UsbDeviceInfo>,
}

impl UsbChanges {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

pub struct UsbManager {
    events: EventBus,
    devices: Mutex<Vec<UsbDeviceInfo>>,
}

impl UsbManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn devices(&self) -> Vec<UsbDeviceInfo> {
        lock(&self.devices).clone()
    }

    /// Replace the known set with `visible`, firing an event per change.
    pub fn refresh(&self, visible: Vec<UsbDeviceInfo>) -> UsbChanges {
        let changes = {
            let mut devices = lock(&self.devices);
            let detached: Vec<UsbDeviceInfo> = devices
                .iter()
                .filter(|known| !visible.iter().any(|d| d.id == known.id))
                .cloned()
                .collect();
            let attached: Vec<UsbDeviceInfo> = visible
                .iter()
                .filter(|d| !devices.iter().any(|known| known.id == d.id))
                .cloned()
                .collect();
            *devices = visible;
            UsbChanges { attached, detached }
        };
        for device in &changes.detached {
            info!("USB device detached: {} (serial {:?})", device.id, device.serial_number);
            self.events.fire(Event::UsbDetached {
                device: device.clone(),
            });
        }
        for device in &changes.attached {
            info!("USB device attached: {} (serial {:?})", device.id, device.serial_number);
            self.events.fire(Event::UsbAttached {
                device: device.clone(),
            });
        }
        changes
    }

    /// First known device matching `serial`, or the first one at all.
    pub fn find(&self, serial: Option<&str>) -> Option<UsbDeviceInfo> {
        lock(&self.devices)
            .iter()
            .find(|d| d.matches_serial(serial))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfx_backend::VirtualBridge;

    #[tokio::test]
    async fn test_refresh_reports_changes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let usb = UsbManager::new(bus);

        let changes = usb.refresh(vec![VirtualBridge::device_info("A"), VirtualBridge::device_info("B")]);
        assert_eq!(changes.attached.len(), 2);
        assert!(changes.detached.is_empty());
        assert!(usb.refresh(usb.devices()).is_empty());

        let changes = usb.refresh(vec![VirtualBridge::device_info("B")]);
        assert_eq!(changes.detached, vec![VirtualBridge::device_info("A")]);

        assert!(matches!(rx.recv().await.unwrap(), Event::UsbAttached { .. }));
        assert!(matches!(rx.recv().await.unwrap(), Event::UsbAttached { .. }));
        match rx.recv().await.unwrap() {
            Event::UsbDetached { device } => assert_eq!(device.serial_number.as_deref(), Some("A")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_find_by_serial() {
        let usb = UsbManager::new(EventBus::new());
        usb.refresh(vec![VirtualBridge::device_info("A"), VirtualBridge::device_info("B")]);
        assert_eq!(usb.find(Some("B")).unwrap().id, "virtual:B");
        assert_eq!(usb.find(None).unwrap().id, "virtual:A");
        assert!(usb.find(Some("C")).is_none());
    }
}
