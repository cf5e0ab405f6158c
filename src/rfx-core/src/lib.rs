// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Orchestration primitives shared by the bioreactor controller crates.
//!
//! Nothing in here talks to hardware directly: devices reach the bus
//! through the [`driver`] contracts and the server crate wires the
//! queues, gate and devices together into a running machine.

pub mod cancel;
pub mod device;
pub mod driver;
pub mod events;
pub mod gate;
pub mod queue;
pub mod registry;
pub mod sync;
pub mod transport;

use std::future::Future;
use std::pin::Pin;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Boxed, sendable future used at trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use cancel::{CancelSignal, CancelWatch};
pub use device::state::DeviceState;
pub use device::{Device, DeviceCore, DeviceData, DeviceListener};
pub use events::{Event, EventBus, ListenerId, MachineEventEmitter, MachineListener};
pub use gate::FlowGate;
pub use queue::{CommandEntry, JobQueue, QueueError, QueueMarker, SendQueue, SendTarget, TypedQueue};
pub use registry::{CommandArgs, CommandError, CommandRegistry, CommandsInfo, ValidationResult};
