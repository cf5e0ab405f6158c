// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Aggregate state publication.
//!
//! Collects machine state, device data and experiment status into one
//! snapshot and publishes it on a watch channel, at most once per
//! interval. Changes arriving in between are coalesced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rfx_core::sync::lock;
use rfx_core::{DeviceData, DeviceState, Event, MachineListener};

use crate::machine::{Machine, MachineData, QueueSizes};
use crate::wait_for_shutdown;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentData {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub machine: MachineData,
    pub devices: BTreeMap<String, DeviceData>,
    pub queues: QueueSizes,
    pub experiment: Option<ExperimentData>,
}

impl StateSnapshot {
    fn collect(machine: &Machine, experiment: Option<ExperimentData>) -> Self {
        Self {
            machine: machine.get_data(),
            devices: machine
                .get_devices_data()
                .into_iter()
                .map(|data| (data.id.clone(), data))
                .collect(),
            queues: machine.queue_sizes(),
            experiment,
        }
    }
}

pub struct StateMonitor {
    interval: Duration,
    dirty: Notify,
    experiment: Mutex<Option<ExperimentData>>,
    snapshot_tx: watch::Sender<StateSnapshot>,
    published: AtomicUsize,
}

impl MachineListener for StateMonitor {
    fn on_machine_state_change(&self, _old: DeviceState, _new: DeviceState) {
        self.dirty.notify_one();
    }

    fn on_device_data_change(&self, _data: &DeviceData) {
        self.dirty.notify_one();
    }
}

impl StateMonitor {
    pub fn new(machine: &Machine, interval: Duration) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(StateSnapshot::collect(machine, None));
        Arc::new(Self {
            interval,
            dirty: Notify::new(),
            experiment: Mutex::new(None),
            snapshot_tx,
            published: AtomicUsize::new(0),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Snapshots published so far.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Register with the machine and spawn the publishing task.
    pub fn spawn(self: &Arc<Self>, machine: Arc<Machine>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let listener = machine.register_listener(self.clone());
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.run(&machine, shutdown_rx).await;
            machine.unregister_listener(listener);
        })
    }

    async fn run(&self, machine: &Machine, shutdown_rx: watch::Receiver<bool>) {
        info!("State monitor started (interval {:?})", self.interval);
        let mut events = machine.services().events.subscribe();
        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx.clone()) => break,
                _ = self.dirty.notified() => {}
                event = events.recv() => match event {
                    Ok(Event::ExperimentStatusChanged { experiment, status }) => {
                        *lock(&self.experiment) = Some(ExperimentData { name: experiment, status });
                    }
                    Ok(Event::CommandQueueUpdated { .. })
                    | Ok(Event::JobQueueUpdated { .. })
                    | Ok(Event::SendQueueUpdated { .. }) => {}
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            self.publish(machine);
            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx.clone()) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("State monitor stopped");
    }

    fn publish(&self, machine: &Machine) {
        let experiment = lock(&self.experiment).clone();
        let snapshot = StateSnapshot::collect(machine, experiment);
        let changed = self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        if changed {
            let count = self.published.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Published state snapshot #{}", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing;

    #[tokio::test]
    async fn test_publishes_coalesced_snapshots() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        let monitor = StateMonitor::new(&machine, Duration::from_millis(50));
        let mut rx = monitor.subscribe();
        assert_eq!(rx.borrow().machine.state_id, "OFFLINE");
        let handle = monitor.spawn(machine.clone(), machine.shutdown_receiver());
        let mut events = machine.services().events.subscribe();
        tokio::task::yield_now().await;

        machine.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let mut transitions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::DeviceStateChanged { .. }) {
                transitions += 1;
            }
        }
        assert!(transitions > 40, "only {transitions} transitions");
        assert!(monitor.published() < 10, "published {}", monitor.published());

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.machine.state_id, "OPERATIONAL");
        assert_eq!(snapshot.devices["valve-1"].state_id, "OPERATIONAL");

        machine.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_experiment_status_included() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        let monitor = StateMonitor::new(&machine, Duration::from_millis(10));
        let handle = monitor.spawn(machine.clone(), machine.shutdown_receiver());
        tokio::task::yield_now().await;

        machine.services().events.fire(Event::ExperimentStatusChanged {
            experiment: "od-measure".to_string(),
            status: "running".to_string(),
        });
        machine.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            monitor.snapshot().experiment,
            Some(ExperimentData {
                name: "od-measure".to_string(),
                status: "running".to_string(),
            })
        );
        machine.shutdown().await;
        handle.await.unwrap();
    }
}
