// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use rfx_core::EventBus;

use crate::usb::UsbManager;

/// Process-wide services, built once in `main` and shared by `Arc`.
pub struct Services {
    pub events: EventBus,
    pub usb: UsbManager,
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

impl Services {
    pub fn new() -> Self {
        let events = EventBus::new();
        Self {
            usb: UsbManager::new(events.clone()),
            events,
        }
    }
}
