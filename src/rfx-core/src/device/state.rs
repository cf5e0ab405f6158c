// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by devices and the machine aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Offline,
    FindingDevice,
    Connecting,
    SelfTesting,
    Operational,
    Starting,
    Working,
    Paused,
    Pausing,
    Resuming,
    Finishing,
    Closed,
    Error,
    ClosedWithError,
    Reconnecting,
    Cancelling,
}

pub const OPERATIONAL_STATES: &[DeviceState] = &[
    DeviceState::Operational,
    DeviceState::Starting,
    DeviceState::Working,
    DeviceState::Paused,
    DeviceState::Pausing,
    DeviceState::Resuming,
    DeviceState::Finishing,
    DeviceState::Cancelling,
];

pub const WORKING_STATES: &[DeviceState] = &[
    DeviceState::Starting,
    DeviceState::Working,
    DeviceState::Pausing,
    DeviceState::Resuming,
    DeviceState::Finishing,
    DeviceState::Cancelling,
];

impl DeviceState {
    /// Stable machine-readable identifier.
    pub fn id(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::FindingDevice => "FINDING_DEVICE",
            Self::Connecting => "CONNECTING",
            Self::SelfTesting => "SELF_TESTING",
            Self::Operational => "OPERATIONAL",
            Self::Starting => "STARTING",
            Self::Working => "WORKING",
            Self::Paused => "PAUSED",
            Self::Pausing => "PAUSING",
            Self::Resuming => "RESUMING",
            Self::Finishing => "FINISHING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
            Self::ClosedWithError => "CLOSED_WITH_ERROR",
            Self::Reconnecting => "RECONNECTING",
            Self::Cancelling => "CANCELLING",
        }
    }

    /// Human readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Offline | Self::Closed => "Offline",
            Self::FindingDevice => "Finding device",
            Self::Connecting => "Connecting",
            Self::SelfTesting => "Self testing",
            Self::Operational => "Operational",
            Self::Starting => "Starting",
            Self::Working => "Working",
            Self::Paused => "Paused",
            Self::Pausing => "Pausing",
            Self::Resuming => "Resuming",
            Self::Finishing => "Finishing",
            Self::Error => "Error",
            Self::ClosedWithError => "Offline after error",
            Self::Reconnecting => "Reconnecting",
            Self::Cancelling => "Cancelling",
        }
    }

    pub fn is_operational(self) -> bool {
        OPERATIONAL_STATES.contains(&self)
    }

    pub fn is_working(self) -> bool {
        WORKING_STATES.contains(&self)
    }

    pub fn is_busy(self) -> bool {
        self.is_working() || matches!(self, Self::Paused | Self::Cancelling | Self::Pausing)
    }

    /// States in which an operator may drive actuators by hand.
    pub fn is_manual_control(self) -> bool {
        matches!(self, Self::Operational | Self::Paused)
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::ClosedWithError)
    }

    pub fn is_closed_or_error(self) -> bool {
        matches!(self, Self::Error | Self::Closed | Self::ClosedWithError)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_states_are_operational() {
        for state in WORKING_STATES {
            assert!(state.is_operational(), "{state:?}");
            assert!(state.is_busy(), "{state:?}");
        }
    }

    #[test]
    fn test_predicates() {
        assert!(DeviceState::Operational.is_manual_control());
        assert!(DeviceState::Paused.is_manual_control());
        assert!(!DeviceState::Working.is_manual_control());
        assert!(DeviceState::Paused.is_busy());
        assert!(!DeviceState::Operational.is_busy());
        assert!(DeviceState::ClosedWithError.is_error());
        assert!(DeviceState::Closed.is_closed_or_error());
        assert!(!DeviceState::Closed.is_error());
        assert!(!DeviceState::Reconnecting.is_operational());
    }

    #[test]
    fn test_serde_name_roundtrip() {
        let json = serde_json::to_string(&DeviceState::ClosedWithError).unwrap();
        assert_eq!(json, "\"ClosedWithError\"");
        assert_eq!(DeviceState::ClosedWithError.id(), "CLOSED_WITH_ERROR");
    }
}
