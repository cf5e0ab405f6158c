// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Device manager: serializes named device operations.
//!
//! One worker per priority class pulls requests off its channel and
//! runs them one at a time, replying through a oneshot channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rfx_core::registry::CommandArgs;
use rfx_core::Device;

use crate::error::{ExecutorError, MachineError};
use crate::wait_for_shutdown;

const REQUEST_QUEUE_CAPACITY: usize = 64;

type DeviceMap = Arc<HashMap<String, Arc<dyn Device>>>;

struct DeviceRequest {
    device_id: String,
    command: String,
    args: CommandArgs,
    respond_to: Option<oneshot::Sender<Result<Value, ExecutorError>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Return as soon as the request is queued.
    pub no_wait: bool,
    pub high_priority: bool,
    /// Stop waiting after this long. The operation may still complete.
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn high_priority() -> Self {
        Self {
            high_priority: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Completed(Value),
    Queued,
    /// Outcome unknown: the worker had not answered in time.
    TimedOut,
}

impl ExecOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Queued | Self::TimedOut => None,
        }
    }
}

#[derive(Clone)]
pub struct DeviceManager {
    devices: DeviceMap,
    normal_tx: mpsc::Sender<DeviceRequest>,
    high_tx: mpsc::Sender<DeviceRequest>,
}

impl DeviceManager {
    /// Build the manager and spawn its two workers, which run until
    /// `shutdown_rx` turns true.
    pub fn spawn(
        devices: &[Arc<dyn Device>],
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(Self, Vec<JoinHandle<()>>), MachineError> {
        let mut map = HashMap::with_capacity(devices.len());
        for device in devices {
            if map.insert(device.id().to_string(), device.clone()).is_some() {
                return Err(MachineError::DuplicateDevice(device.id().to_string()));
            }
        }
        let devices: DeviceMap = Arc::new(map);
        let (normal_tx, normal_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (high_tx, high_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let handles = vec![
            tokio::spawn(run_worker("normal", devices.clone(), normal_rx, shutdown_rx.clone())),
            tokio::spawn(run_worker("high-priority", devices.clone(), high_rx, shutdown_rx)),
        ];
        Ok((
            Self {
                devices,
                normal_tx,
                high_tx,
            },
            handles,
        ))
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub async fn execute(
        &self,
        device_id: &str,
        command: &str,
        args: CommandArgs,
        options: ExecOptions,
    ) -> Result<ExecOutcome, ExecutorError> {
        if !self.contains(device_id) {
            return Err(ExecutorError::UnknownDevice(device_id.to_string()));
        }
        let tx = if options.high_priority {
            &self.high_tx
        } else {
            &self.normal_tx
        };
        let (resp_tx, resp_rx) = if options.no_wait {
            (None, None)
        } else {
            let (resp_tx, resp_rx) = oneshot::channel();
            (Some(resp_tx), Some(resp_rx))
        };
        let request = DeviceRequest {
            device_id: device_id.to_string(),
            command: command.to_string(),
            args,
            respond_to: resp_tx,
        };
        tx.send(request)
            .await
            .map_err(|_| ExecutorError::WorkerGone)?;

        let Some(resp_rx) = resp_rx else {
            return Ok(ExecOutcome::Queued);
        };
        let response = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, resp_rx).await {
                Ok(response) => response,
                Err(_) => {
                    debug!("{}.{}: no answer after {:?}", device_id, command, timeout);
                    return Ok(ExecOutcome::TimedOut);
                }
            },
            None => resp_rx.await,
        };
        response
            .map_err(|_| ExecutorError::WorkerGone)?
            .map(ExecOutcome::Completed)
    }
}

async fn run_worker(
    name: &'static str,
    devices: DeviceMap,
    mut rx: mpsc::Receiver<DeviceRequest>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            _ = wait_for_shutdown(shutdown_rx.clone()) => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let result = match devices.get(&request.device_id) {
            Some(device) => run_request(device.clone(), &request).await,
            None => Err(ExecutorError::UnknownDevice(request.device_id.clone())),
        };
        if let Err(e) = &result {
            warn!("{} executor: {}", name, e);
        }
        if let Some(respond_to) = request.respond_to {
            let _ = respond_to.send(result);
        }
    }
    debug!("{} executor stopped", name);
}

/// Run one device operation on its own task so a panicking device
/// fails only its own request.
async fn run_request(device: Arc<dyn Device>, request: &DeviceRequest) -> Result<Value, ExecutorError> {
    let command = request.command.clone();
    let args = request.args.clone();
    let failed = |reason: String| ExecutorError::Failed {
        device: request.device_id.clone(),
        command: request.command.clone(),
        reason,
    };
    match tokio::spawn(async move { device.execute(&command, &args).await }).await {
        Ok(result) => result.map_err(|e| failed(e.to_string())),
        Err(e) if e.is_panic() => Err(failed("device panicked".to_string())),
        Err(e) => Err(failed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::TestBoard;
    use crate::devices::{Valve, Vial};
    use rfx_backend::BoardLayout;
    use rfx_core::device::DeviceFuture;
    use rfx_core::driver::Driver;
    use rfx_core::DeviceCore;
    use serde_json::json;
    use std::any::Any;

    async fn explode() -> rfx_core::DynResult<Value> {
        panic!("register map out of bounds")
    }

    /// Device whose every command panics.
    struct Faulty {
        core: DeviceCore,
    }

    impl Device for Faulty {
        fn core(&self) -> &DeviceCore {
            &self.core
        }

        fn reset_state(&self) -> DeviceFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn read_state(&self) -> DeviceFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn probe(&self) -> DeviceFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn drivers(&self) -> Vec<Arc<dyn Driver>> {
            Vec::new()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn execute<'a>(&'a self, _command: &'a str, _args: &'a CommandArgs) -> DeviceFuture<'a, Value> {
            Box::pin(explode())
        }
    }

    fn vials() -> Vec<Arc<dyn Device>> {
        vec![Arc::new(Vial::new(1, None)), Arc::new(Vial::new(2, None))]
    }

    /// Manager plus the shutdown sender keeping its workers alive.
    fn spawn(devices: &[Arc<dyn Device>]) -> (DeviceManager, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (manager, _handles) = DeviceManager::spawn(devices, shutdown_rx).unwrap();
        (manager, shutdown_tx)
    }

    #[tokio::test]
    async fn test_execute_returns_value() {
        let (manager, _shutdown) = spawn(&vials());
        let outcome = manager
            .execute("vial-2", "reset_volume", CommandArgs::new(), ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Completed(json!(0.0)));
    }

    #[tokio::test]
    async fn test_unknown_device_and_command() {
        let (manager, _shutdown) = spawn(&vials());
        let err = manager
            .execute("vial-9", "reset_volume", CommandArgs::new(), ExecOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::UnknownDevice("vial-9".to_string()));

        let err = manager
            .execute("vial-1", "explode", CommandArgs::new(), ExecOptions::high_priority())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "vial-1.explode failed: unknown command 'explode'");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = runtime.enter();
        let devices: Vec<Arc<dyn Device>> = vec![Arc::new(Vial::new(1, None)), Arc::new(Vial::new(1, None))];
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = DeviceManager::spawn(&devices, shutdown_rx).err().unwrap();
        assert_eq!(err, MachineError::DuplicateDevice("vial-1".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_means_unknown_outcome() {
        let board = TestBoard::connected().await;
        let valve = Arc::new(Valve::new(
            "Valve 1",
            board.board.pwm_output(),
            BoardLayout::valve_channel(1),
            Duration::from_millis(200),
        ));
        valve.connect().await.unwrap();
        let devices: Vec<Arc<dyn Device>> = vec![valve.clone()];
        let (manager, _shutdown) = spawn(&devices);

        let options = ExecOptions {
            timeout: Some(Duration::from_millis(20)),
            ..ExecOptions::default()
        };
        let outcome = manager
            .execute("valve-1", "open", CommandArgs::new(), options)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::TimedOut);
        // still applied afterwards
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(valve.is_open());
    }

    #[tokio::test]
    async fn test_no_wait_queues() {
        let (manager, _shutdown) = spawn(&vials());
        let options = ExecOptions {
            no_wait: true,
            ..ExecOptions::default()
        };
        let outcome = manager
            .execute("vial-1", "reset_volume", CommandArgs::new(), options)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Queued);
    }

    #[tokio::test]
    async fn test_panicking_device_keeps_worker_alive() {
        let devices: Vec<Arc<dyn Device>> = vec![
            Arc::new(Faulty {
                core: DeviceCore::new("Faulty 1"),
            }),
            Arc::new(Vial::new(1, None)),
        ];
        let (manager, _shutdown) = spawn(&devices);
        for options in [ExecOptions::default(), ExecOptions::high_priority()] {
            let err = manager
                .execute("faulty-1", "run", CommandArgs::new(), options)
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "faulty-1.run failed: device panicked");
            let outcome = manager
                .execute("vial-1", "reset_volume", CommandArgs::new(), options)
                .await
                .unwrap();
            assert_eq!(outcome, ExecOutcome::Completed(json!(0.0)));
        }
    }
}
