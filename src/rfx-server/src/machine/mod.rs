// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The machine orchestrator.
//!
//! Owns every device, the queue hierarchy and the flow-control gate,
//! and runs the dispatch loops that move queued work onto the bus:
//!
//! - `routing`: where a command goes (job, command or send queue).
//! - `dispatch`: the sending and high-priority loops.
//! - `lifecycle`: connect, close and USB hot-plug handling.
//! - `verbs`: business-level commands and job control.

mod dispatch;
mod lifecycle;
mod routing;
mod verbs;

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use rfx_backend::{Board, BoardLayout};
use rfx_core::registry::CommandRegistry;
use rfx_core::sync::{lock, read, write};
use rfx_core::transport::{Bridge, UsbDeviceInfo};
use rfx_core::{
    CancelSignal, CommandEntry, Device, DeviceData, DeviceListener, DeviceState, Event, FlowGate,
    JobQueue, ListenerId, MachineEventEmitter, MachineListener, SendQueue, TypedQueue,
};

use crate::devices::{OdSensor, Pump, PumpRole, Stirrer, Thermometer, Valve, Vial};
use crate::error::MachineError;
use crate::executor::DeviceManager;
use crate::services::Services;

pub use lifecycle::ConnectionState;
pub use routing::{Routing, SendOptions};

pub const MACHINE_ID: &str = "machine";
pub const PUMP_MAX_SPEED_RPS: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MachineOptions {
    pub name: String,
    /// Bridge to open; `None` takes the first one found.
    pub serial_number: Option<String>,
    pub reconnect: bool,
    /// Flow-control window: commands in flight at once.
    pub ack_max: u32,
    pub layout: BoardLayout,
    pub valve_settle: Duration,
    /// Time the OD laser is given before the photodiode is read.
    pub laser_settle: Duration,
    pub await_poll: Duration,
    pub stop_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            name: "Bioreactor".to_string(),
            serial_number: None,
            reconnect: true,
            ack_max: 1,
            layout: BoardLayout::default(),
            valve_settle: Duration::from_millis(500),
            laser_settle: Duration::from_millis(20),
            await_poll: Duration::from_millis(500),
            stop_timeout: Duration::from_millis(5000),
            monitor_interval: Duration::from_millis(1000),
        }
    }
}

/// Outward view of the machine itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineData {
    pub id: String,
    pub name: String,
    pub state_id: String,
    pub state_string: String,
    pub error: String,
}

pub struct Machine {
    me: Weak<Machine>,
    options: MachineOptions,
    services: Arc<Services>,
    bridge: Arc<dyn Bridge>,
    board: Board,

    valves: Vec<Arc<Valve>>,
    stirrers: Vec<Arc<Stirrer>>,
    od_sensors: Vec<Arc<OdSensor>>,
    pumps: Vec<Arc<Pump>>,
    thermometers: Vec<Arc<Thermometer>>,
    vials: Vec<Arc<Vial>>,
    /// Registration order, used for the connect cascade.
    devices: Vec<Arc<dyn Device>>,
    executor: DeviceManager,

    hp_queue: SendQueue<CommandEntry>,
    send_queue: SendQueue<CommandEntry>,
    command_queue: TypedQueue<CommandEntry>,
    job_queue: JobQueue<CommandEntry>,
    clear_to_send: FlowGate,
    job_on_hold: FlowGate,
    cancel: CancelSignal,
    /// Held while a dispatched command is on the bus.
    sending: tokio::sync::Mutex<()>,
    /// Keeps batches contiguous.
    enqueue: Mutex<()>,
    continuing: Mutex<()>,

    state: Mutex<DeviceState>,
    error: Mutex<String>,
    connection: Mutex<ConnectionState>,
    usb_device: Mutex<Option<UsbDeviceInfo>>,
    connect_lock: tokio::sync::Mutex<()>,
    closing: std::sync::atomic::AtomicBool,

    emitter: RwLock<MachineEventEmitter>,
    registry: CommandRegistry<Machine>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Forwards device state changes to the machine.
struct DeviceRelay {
    machine: Weak<Machine>,
}

impl DeviceListener for DeviceRelay {
    fn on_device_state_change(&self, data: &DeviceData, _old: DeviceState, new: DeviceState) {
        if let Some(machine) = self.machine.upgrade() {
            machine.publish_device_data(data);
            machine.services.events.fire(Event::DeviceStateChanged {
                device_id: data.id.clone(),
                state_id: new.id().to_string(),
            });
        }
    }
}

impl Machine {
    /// Build the machine and its devices. Must run inside a tokio
    /// runtime: the device manager workers are spawned here.
    pub fn new(
        options: MachineOptions,
        services: Arc<Services>,
        bridge: Arc<dyn Bridge>,
    ) -> Result<Arc<Self>, MachineError> {
        let layout = options.layout;
        let board = Board::build(bridge.clone(), &layout);

        let mut valves = Vec::new();
        let mut stirrers = Vec::new();
        let mut od_sensors = Vec::new();
        for vial in 1..=layout.vials {
            valves.push(Arc::new(Valve::new(
                format!("Valve {vial}"),
                board.pwm_output(),
                BoardLayout::valve_channel(vial),
                options.valve_settle,
            )));
            stirrers.push(Arc::new(Stirrer::new(
                format!("Stirrer {vial}"),
                board.pwm_output(),
                BoardLayout::stirrer_channel(vial),
            )));
            let optics = BoardLayout::optics_channel(vial);
            od_sensors.push(Arc::new(OdSensor::new(
                format!("OD sensor {vial}"),
                board.io_expander(),
                optics,
                board.adc_input(),
                optics,
                options.laser_settle,
            )));
        }
        let pumps: Vec<Arc<Pump>> = (1..=layout.pumps)
            .filter_map(|n| {
                let motor = board.stepper(n)?;
                Some(Arc::new(Pump::new(format!("Pump {n}"), motor, PUMP_MAX_SPEED_RPS)))
            })
            .collect();
        let thermometers: Vec<Arc<Thermometer>> = (0..usize::from(layout.thermometers))
            .filter_map(|i| {
                let sensor = board.thermometer(i)?;
                Some(Arc::new(Thermometer::new(format!("Thermometer {}", i + 1), sensor)))
            })
            .collect();
        let vial_thermometer = thermometers.first().map(|t| t.id().to_string());
        let vials: Vec<Arc<Vial>> = (1..=layout.vials)
            .map(|n| Arc::new(Vial::new(n, vial_thermometer.clone())))
            .collect();

        let mut devices: Vec<Arc<dyn Device>> = Vec::new();
        devices.extend(valves.iter().map(|d| d.clone() as Arc<dyn Device>));
        devices.extend(stirrers.iter().map(|d| d.clone() as Arc<dyn Device>));
        devices.extend(od_sensors.iter().map(|d| d.clone() as Arc<dyn Device>));
        devices.extend(pumps.iter().map(|d| d.clone() as Arc<dyn Device>));
        devices.extend(thermometers.iter().map(|d| d.clone() as Arc<dyn Device>));
        devices.extend(vials.iter().map(|d| d.clone() as Arc<dyn Device>));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (executor, executor_tasks) = DeviceManager::spawn(&devices, shutdown_rx)?;
        let ack_max = i64::from(options.ack_max.max(1));

        let machine = Arc::new_cyclic(|me: &Weak<Machine>| {
            let relay: Arc<dyn DeviceListener> = Arc::new(DeviceRelay { machine: me.clone() });
            for device in &devices {
                device.set_listener(relay.clone());
            }
            Machine {
                me: me.clone(),
                options,
                services,
                bridge,
                board,
                valves,
                stirrers,
                od_sensors,
                pumps,
                thermometers,
                vials,
                devices,
                executor,
                hp_queue: SendQueue::new(),
                send_queue: SendQueue::new(),
                command_queue: TypedQueue::new(),
                job_queue: JobQueue::new(),
                clear_to_send: FlowGate::with_bounds("clear_to_send", Some(0), Some(ack_max)),
                job_on_hold: FlowGate::with_bounds("job_on_hold", Some(0), None),
                cancel: CancelSignal::new(),
                sending: tokio::sync::Mutex::new(()),
                enqueue: Mutex::new(()),
                continuing: Mutex::new(()),
                state: Mutex::new(DeviceState::Offline),
                error: Mutex::new(String::new()),
                connection: Mutex::new(ConnectionState::Disconnected),
                usb_device: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                closing: std::sync::atomic::AtomicBool::new(false),
                emitter: RwLock::new(MachineEventEmitter::new()),
                registry: verbs::machine_registry(),
                shutdown_tx,
                tasks: Mutex::new(executor_tasks),
            }
        });
        info!(
            "{}: {} devices registered ({} vials, {} pumps)",
            machine.options.name,
            machine.devices.len(),
            machine.vials.len(),
            machine.pumps.len()
        );
        Ok(machine)
    }

    /// Spawn the dispatch loops and the connection monitor.
    pub fn start(self: &Arc<Self>) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(dispatch::run_send_loop(self.clone(), shutdown_rx.clone())));
        tasks.push(tokio::spawn(dispatch::run_high_priority_loop(
            self.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(crate::monitor::run_connection_monitor(
            self.clone(),
            shutdown_rx,
        )));
    }

    /// Close the connection, stop every loop and join them.
    pub async fn shutdown(&self) {
        if self.connection_state() != ConnectionState::Disconnected {
            if let Err(e) = self.close(false).await {
                warn!("Error while closing connection on shutdown: {}", e);
            }
        }
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(self.options.stop_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("Task did not stop within {:?}, aborting", self.options.stop_timeout);
                handle.abort();
            }
        }
        info!("{}: shut down", self.options.name);
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    pub fn error(&self) -> String {
        lock(&self.error).clone()
    }

    fn set_error(&self, message: impl Into<String>) {
        *lock(&self.error) = message.into();
    }

    /// Transition the aggregate state, notifying listeners on change.
    pub(crate) fn set_state(&self, new: DeviceState) {
        let old = {
            let mut state = lock(&self.state);
            if *state == new {
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        info!("{}: {} -> {}", self.options.name, old, new);
        read(&self.emitter).notify_machine_state_change(old, new);
        self.services.events.fire(Event::MachineStateChanged {
            state_id: new.id().to_string(),
            state_string: new.label().to_string(),
        });
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    pub fn is_manual_control(&self) -> bool {
        self.state().is_manual_control()
    }

    pub fn is_operational(&self) -> bool {
        self.state().is_operational()
    }

    pub fn is_error(&self) -> bool {
        self.state().is_error()
    }

    pub fn is_closed_or_error(&self) -> bool {
        self.state().is_closed_or_error()
    }

    pub fn get_data(&self) -> MachineData {
        let state = self.state();
        MachineData {
            id: MACHINE_ID.to_string(),
            name: self.options.name.clone(),
            state_id: state.id().to_string(),
            state_string: state.label().to_string(),
            error: self.error(),
        }
    }

    pub fn get_devices_data(&self) -> Vec<DeviceData> {
        self.devices.iter().map(|d| d.get_data()).collect()
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<dyn Device>> {
        self.executor.device(device_id)
    }

    pub fn executor(&self) -> &DeviceManager {
        &self.executor
    }

    pub fn vials(&self) -> &[Arc<Vial>] {
        &self.vials
    }

    pub fn vial(&self, number: u8) -> Result<&Arc<Vial>, MachineError> {
        self.vials
            .iter()
            .find(|v| v.number() == number)
            .ok_or_else(|| MachineError::UnknownDevice(format!("vial-{number}")))
    }

    pub fn valve(&self, device_id: &str) -> Result<&Arc<Valve>, MachineError> {
        find_device(&self.valves, device_id)
    }

    pub fn stirrer(&self, device_id: &str) -> Result<&Arc<Stirrer>, MachineError> {
        find_device(&self.stirrers, device_id)
    }

    pub fn od_sensor(&self, device_id: &str) -> Result<&Arc<OdSensor>, MachineError> {
        find_device(&self.od_sensors, device_id)
    }

    pub fn pump(&self, device_id: &str) -> Result<&Arc<Pump>, MachineError> {
        find_device(&self.pumps, device_id)
    }

    pub fn pump_for(&self, role: PumpRole) -> Result<&Arc<Pump>, MachineError> {
        self.pump(&role.pump_id())
    }

    pub fn pumps(&self) -> &[Arc<Pump>] {
        &self.pumps
    }

    pub fn thermometer(&self, device_id: &str) -> Result<&Arc<Thermometer>, MachineError> {
        find_device(&self.thermometers, device_id)
    }

    pub fn register_listener(&self, listener: Arc<dyn MachineListener>) -> ListenerId {
        write(&self.emitter).register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        write(&self.emitter).unregister(id);
    }

    /// Republish a device snapshot to listeners.
    pub(crate) fn publish_device_data(&self, data: &DeviceData) {
        read(&self.emitter).notify_device_data_change(data);
    }

    pub fn queue_sizes(&self) -> QueueSizes {
        QueueSizes {
            high_priority: self.hp_queue.len(),
            send: self.send_queue.len(),
            command: self.command_queue.len(),
            job: self.job_queue.len(),
        }
    }

    fn weak(&self) -> Weak<Machine> {
        self.me.clone()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSizes {
    pub high_priority: usize,
    pub send: usize,
    pub command: usize,
    pub job: usize,
}

fn find_device<'a, D: Device>(devices: &'a [Arc<D>], device_id: &str) -> Result<&'a Arc<D>, MachineError> {
    devices
        .iter()
        .find(|d| d.id() == device_id)
        .ok_or_else(|| MachineError::UnknownDevice(device_id.to_string()))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use rfx_backend::VirtualBridge;
    use rfx_core::transport::Bridge;

    use super::{Machine, MachineOptions};
    use crate::services::Services;

    pub const SERIAL: &str = "RFX-MACHINE-1";

    pub fn options() -> MachineOptions {
        MachineOptions {
            serial_number: Some(SERIAL.to_string()),
            valve_settle: Duration::from_millis(5),
            laser_settle: Duration::from_millis(1),
            await_poll: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(500),
            monitor_interval: Duration::from_millis(20),
            ..MachineOptions::default()
        }
    }

    pub fn machine_with(options: MachineOptions) -> (Arc<Machine>, Arc<VirtualBridge>) {
        let bridge = Arc::new(VirtualBridge::with_serial(SERIAL));
        bridge.seed_board(&options.layout);
        let machine = Machine::new(
            options,
            Arc::new(Services::new()),
            bridge.clone() as Arc<dyn Bridge>,
        )
        .unwrap();
        (machine, bridge)
    }

    /// Poll `cond` until it holds; fails the test after two seconds.
    pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let polled = tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "timed out waiting for {what}");
    }

    /// Connected and running machine on a fresh virtual board.
    pub async fn running() -> (Arc<Machine>, Arc<VirtualBridge>) {
        let (machine, bridge) = machine_with(options());
        machine.start();
        machine.connect().await.unwrap();
        (machine, bridge)
    }
}
