// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-hardware-unit state machine.
//!
//! A device owns a [`DeviceCore`] with its identity, state and last
//! error. State only changes through [`Device::set_state`], which
//! notifies the registered [`DeviceListener`] once per real change.

pub mod state;

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::registry::{CommandArgs, CommandError, CommandsInfo};
use crate::sync::{lock, read, write};
use crate::{BoxFuture, DynResult};

use state::DeviceState;

pub type DeviceFuture<'a, T> = BoxFuture<'a, DynResult<T>>;

/// Snapshot published upward on every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceData {
    pub id: String,
    pub name: String,
    pub state_id: String,
    pub state_string: String,
    pub error: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub trait DeviceListener: Send + Sync {
    fn on_device_state_change(&self, data: &DeviceData, old: DeviceState, new: DeviceState);
}

/// Lowercase, dash separated identifier derived from a display name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub struct DeviceCore {
    id: String,
    name: String,
    state: Mutex<DeviceState>,
    error: Mutex<String>,
    listener: RwLock<Option<Arc<dyn DeviceListener>>>,
}

impl std::fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceCore {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: slugify(&name),
            name,
            state: Mutex::new(DeviceState::Offline),
            error: Mutex::new(String::new()),
            listener: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    pub fn error(&self) -> String {
        lock(&self.error).clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *lock(&self.error) = message.into();
    }

    pub fn set_listener(&self, listener: Arc<dyn DeviceListener>) {
        *write(&self.listener) = Some(listener);
    }

    /// Store a new state, returning the previous one if it changed.
    fn swap_state(&self, new: DeviceState) -> Option<DeviceState> {
        let mut state = lock(&self.state);
        if *state == new {
            return None;
        }
        Some(std::mem::replace(&mut *state, new))
    }

    fn listener(&self) -> Option<Arc<dyn DeviceListener>> {
        read(&self.listener).clone()
    }
}

pub trait Device: Send + Sync + 'static {
    fn core(&self) -> &DeviceCore;

    /// Restore the hardware to the last known configuration.
    fn reset_state(&self) -> DeviceFuture<'_, ()>;

    /// Synchronize cached state with the hardware.
    fn read_state(&self) -> DeviceFuture<'_, ()>;

    /// Device specific self-test.
    fn probe(&self) -> DeviceFuture<'_, ()>;

    fn drivers(&self) -> Vec<Arc<dyn Driver>>;

    fn as_any(&self) -> &dyn Any;

    /// Device specific fields merged into [`DeviceData`].
    fn extra_data(&self) -> Map<String, Value> {
        Map::new()
    }

    fn commands_info(&self) -> CommandsInfo {
        CommandsInfo::new()
    }

    fn execute<'a>(&'a self, command: &'a str, _args: &'a CommandArgs) -> DeviceFuture<'a, Value> {
        Box::pin(async move { Err(CommandError::Unknown(command.to_string()).into()) })
    }

    fn id(&self) -> &str {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> DeviceState {
        self.core().state()
    }

    fn error(&self) -> String {
        self.core().error()
    }

    fn get_state_string(&self) -> String {
        self.state().label().to_string()
    }

    fn set_listener(&self, listener: Arc<dyn DeviceListener>) {
        self.core().set_listener(listener);
    }

    /// The one place device state changes.
    fn set_state(&self, new: DeviceState) {
        let Some(old) = self.core().swap_state(new) else {
            return;
        };
        debug!("{}: {} -> {}", self.id(), old, new);
        if let Some(listener) = self.core().listener() {
            listener.on_device_state_change(&self.get_data(), old, new);
        }
    }

    /// Record an error and demote to [`DeviceState::Error`].
    fn fail(&self, message: &str) {
        warn!("{}: {}", self.id(), message);
        self.core().set_error(message);
        self.set_state(DeviceState::Error);
    }

    fn get_data(&self) -> DeviceData {
        let state = self.state();
        DeviceData {
            id: self.id().to_string(),
            name: self.name().to_string(),
            state_id: state.id().to_string(),
            state_string: self.get_state_string(),
            error: self.error(),
            extra: self.extra_data(),
        }
    }

    fn connect(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.set_state(DeviceState::Connecting);
            self.core().set_error("");
            guarded(self, async {
                self.reset_state().await?;
                self.read_state().await
            })
            .await
        })
    }

    fn disconnect(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            if !self.state().is_error() {
                self.set_state(DeviceState::Closed);
            }
            Ok(())
        })
    }

    /// Run the self-test. Returns whether it passed.
    fn test(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.set_state(DeviceState::SelfTesting);
            if let Err(e) = self.probe().await {
                self.fail(&e.to_string());
                return false;
            }
            guarded(self, self.read_state()).await.is_ok()
        })
    }
}

/// Await a device operation, demoting the device on failure.
pub async fn guarded<D, T, F>(device: &D, op: F) -> DynResult<T>
where
    D: Device + ?Sized,
    F: Future<Output = DynResult<T>>,
{
    match op.await {
        Ok(value) => Ok(value),
        Err(e) => {
            device.fail(&e.to_string());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Probe {
        core: DeviceCore,
        probe_fails: AtomicBool,
    }

    impl Probe {
        fn new(fails: bool) -> Self {
            Self {
                core: DeviceCore::new("Probe Device 1"),
                probe_fails: AtomicBool::new(fails),
            }
        }
    }

    impl Device for Probe {
        fn core(&self) -> &DeviceCore {
            &self.core
        }

        fn reset_state(&self) -> DeviceFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn read_state(&self) -> DeviceFuture<'_, ()> {
            Box::pin(async move {
                self.set_state(DeviceState::Operational);
                Ok(())
            })
        }

        fn probe(&self) -> DeviceFuture<'_, ()> {
            Box::pin(async move {
                if self.probe_fails.load(Ordering::SeqCst) {
                    Err("probe failed: no response".into())
                } else {
                    Ok(())
                }
            })
        }

        fn drivers(&self) -> Vec<Arc<dyn Driver>> {
            Vec::new()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Recorder {
        changes: Mutex<Vec<(DeviceState, DeviceState)>>,
    }

    impl DeviceListener for Recorder {
        fn on_device_state_change(&self, data: &DeviceData, old: DeviceState, new: DeviceState) {
            assert_eq!(data.state_id, new.id());
            lock(&self.changes).push((old, new));
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Valve 3"), "valve-3");
        assert_eq!(slugify("  OD sensor #2 "), "od-sensor-2");
    }

    #[test]
    fn test_set_state_notifies_once_per_change() {
        let device = Probe::new(false);
        let recorder = Arc::new(Recorder {
            changes: Mutex::new(Vec::new()),
        });
        device.set_listener(recorder.clone());
        device.set_state(DeviceState::Operational);
        device.set_state(DeviceState::Operational);
        device.set_state(DeviceState::Working);
        assert_eq!(
            *lock(&recorder.changes),
            vec![
                (DeviceState::Offline, DeviceState::Operational),
                (DeviceState::Operational, DeviceState::Working),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_probe_demotes_to_error() {
        let device = Probe::new(true);
        assert!(!device.test().await);
        assert_eq!(device.state(), DeviceState::Error);
        assert_eq!(device.error(), "probe failed: no response");
    }

    #[tokio::test]
    async fn test_passed_probe_rereads_state() {
        let device = Probe::new(false);
        assert!(device.test().await);
        assert_eq!(device.state(), DeviceState::Operational);
    }

    #[tokio::test]
    async fn test_connect_and_data() {
        let device = Probe::new(false);
        device.connect().await.unwrap();
        let data = device.get_data();
        assert_eq!(data.id, "probe-device-1");
        assert_eq!(data.state_string, "Operational");
        assert!(data.error.is_empty());
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["state_id"], "OPERATIONAL");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let device = Probe::new(false);
        let err = device.execute("spin", &CommandArgs::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown command 'spin'");
    }
}
