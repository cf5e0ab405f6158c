// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use thiserror::Error;

use rfx_core::DeviceState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("machine is not connected")]
    NotConnected,
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: DeviceState,
    },
    #[error("device '{0}' not found")]
    UnknownDevice(String),
    #[error("device '{0}' is registered twice")]
    DuplicateDevice(String),
    #[error("no USB bridge found (serial: {0})")]
    NoUsbDevice(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("device '{0}' not found")]
    UnknownDevice(String),
    #[error("{device}.{command} failed: {reason}")]
    Failed {
        device: String,
        command: String,
        reason: String,
    },
    #[error("executor worker has stopped")]
    WorkerGone,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExperimentError {
    #[error("cannot {action} an experiment that is {status}")]
    InvalidStatus {
        action: &'static str,
        status: crate::experiment::ExperimentStatus,
    },
    #[error(transparent)]
    Machine(#[from] MachineError),
}
