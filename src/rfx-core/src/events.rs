// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Machine event notification.
//!
//! Two channels exist side by side: [`MachineEventEmitter`] calls
//! registered listeners synchronously on state and device changes,
//! while [`EventBus`] broadcasts [`Event`] values to any number of
//! async subscribers (connection monitor, state publication, API).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::device::state::DeviceState;
use crate::device::DeviceData;
use crate::transport::UsbDeviceInfo;

const EVENT_BUS_CAPACITY: usize = 256;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receives machine callbacks. All methods default to no-ops.
pub trait MachineListener: Send + Sync {
    /// Called when the aggregate machine state transitions.
    fn on_machine_state_change(&self, _old: DeviceState, _new: DeviceState) {}

    /// Called when a device republishes its data.
    fn on_device_data_change(&self, _data: &DeviceData) {}
}

#[derive(Default)]
pub struct MachineEventEmitter {
    listeners: Vec<(ListenerId, Arc<dyn MachineListener>)>,
}

impl MachineEventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The returned id unregisters it.
    pub fn register(&mut self, listener: Arc<dyn MachineListener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push((id, listener));
        id
    }

    pub fn unregister(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn notify_machine_state_change(&self, old: DeviceState, new: DeviceState) {
        for (_, listener) in &self.listeners {
            listener.on_machine_state_change(old, new);
        }
    }

    pub fn notify_device_data_change(&self, data: &DeviceData) {
        for (_, listener) in &self.listeners {
            listener.on_device_data_change(data);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MachineConnecting,
    MachineConnected,
    MachineDisconnected,
    MachineStateChanged { state_id: String, state_string: String },
    DeviceStateChanged { device_id: String, state_id: String },
    CommandQueueUpdated { size: usize },
    JobQueueUpdated { size: usize },
    SendQueueUpdated { size: usize },
    UsbAttached { device: UsbDeviceInfo },
    UsbDetached { device: UsbDeviceInfo },
    ExperimentStatusChanged { experiment: String, status: String },
    Error { error: String, reason: String },
}

/// Broadcast fan-out of [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn fire(&self, event: Event) {
        trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use serde_json::Map;

    #[derive(Default)]
    struct CountingListener {
        states: AtomicUsize,
        devices: AtomicUsize,
    }

    impl MachineListener for CountingListener {
        fn on_machine_state_change(&self, _old: DeviceState, _new: DeviceState) {
            self.states.fetch_add(1, Ordering::SeqCst);
        }

        fn on_device_data_change(&self, _data: &DeviceData) {
            self.devices.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SilentListener;

    impl MachineListener for SilentListener {}

    #[test]
    fn test_register_notify_unregister() {
        let mut emitter = MachineEventEmitter::new();
        let listener = Arc::new(CountingListener::default());
        let id = emitter.register(listener.clone());
        emitter.register(Arc::new(SilentListener));
        assert_eq!(emitter.listener_count(), 2);

        emitter.notify_machine_state_change(DeviceState::Offline, DeviceState::Operational);
        emitter.notify_device_data_change(&DeviceData {
            id: "valve-1".to_string(),
            name: "Valve 1".to_string(),
            state_id: "OPERATIONAL".to_string(),
            state_string: "Operational".to_string(),
            error: String::new(),
            extra: Map::new(),
        });
        assert_eq!(listener.states.load(Ordering::SeqCst), 1);
        assert_eq!(listener.devices.load(Ordering::SeqCst), 1);

        emitter.unregister(id);
        assert_eq!(emitter.listener_count(), 1);
        emitter.notify_machine_state_change(DeviceState::Operational, DeviceState::Working);
        assert_eq!(listener.states.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_ids_unique() {
        assert_ne!(ListenerId::new(), ListenerId::new());
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = EventBus::new();
        bus.fire(Event::MachineConnecting);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.fire(Event::CommandQueueUpdated { size: 2 });
        assert_eq!(a.recv().await.unwrap(), Event::CommandQueueUpdated { size: 2 });
        assert_eq!(b.recv().await.unwrap(), Event::CommandQueueUpdated { size: 2 });
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(Event::SendQueueUpdated { size: 1 }).unwrap();
        assert_eq!(json["type"], "send_queue_updated");
        assert_eq!(json["size"], 1);
    }
}
