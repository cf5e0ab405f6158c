// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::HashMap;
use std::sync::Arc;

use rfx_core::transport::Bridge;
use rfx_core::DynResult;

pub mod board;
pub mod drivers;
mod virtual_bridge;

pub use board::{Board, BoardLayout};
pub use virtual_bridge::VirtualBridge;

pub const DEFAULT_VIRTUAL_SERIAL: &str = "RFX-VIRTUAL-1";

/// Parameters handed to a bridge factory.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub serial_number: Option<String>,
    pub layout: BoardLayout,
}

pub type BackendFactory = fn(&BackendOptions) -> DynResult<Arc<dyn Bridge>>;

/// Bridge backends available to the server, keyed by normalized name.
#[derive(Clone)]
pub struct RegistrationContext {
    factories: HashMap<String, BackendFactory>,
}

impl RegistrationContext {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under a stable name (e.g. "virtual").
    pub fn register_backend(&mut self, name: &str, factory: BackendFactory) {
        self.factories.insert(normalize_name(name), factory);
    }

    pub fn is_backend_registered(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize_name(name))
    }

    /// Sorted list of registered names.
    pub fn registered_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build_bridge(&self, name: &str, options: &BackendOptions) -> DynResult<Arc<dyn Bridge>> {
        let factory = self
            .factories
            .get(&normalize_name(name))
            .ok_or_else(|| {
                format!(
                    "Unknown bridge backend: {} (available: {})",
                    name,
                    self.registered_backends().join(", ")
                )
            })?;
        factory(options)
    }
}

impl Default for RegistrationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase alphanumeric form of a backend name.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn register_builtin_backends_on(context: &mut RegistrationContext) {
    context.register_backend("virtual", virtual_factory);
}

fn virtual_factory(options: &BackendOptions) -> DynResult<Arc<dyn Bridge>> {
    options.layout.validate()?;
    let serial = options
        .serial_number
        .as_deref()
        .unwrap_or(DEFAULT_VIRTUAL_SERIAL);
    let bridge = VirtualBridge::with_serial(serial);
    bridge.seed_board(&options.layout);
    Ok(Arc::new(bridge))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Virtual"), "virtual");
        assert_eq!(normalize_name("ft-232h"), "ft232h");
    }

    #[test]
    fn test_builtin_registration() {
        let mut context = RegistrationContext::new();
        register_builtin_backends_on(&mut context);
        assert!(context.is_backend_registered("VIRTUAL"));
        assert_eq!(context.registered_backends(), vec!["virtual".to_string()]);
    }

    #[test]
    fn test_build_virtual_bridge() {
        let mut context = RegistrationContext::new();
        register_builtin_backends_on(&mut context);
        let options = BackendOptions {
            serial_number: Some("RF-42".to_string()),
            ..BackendOptions::default()
        };
        let bridge = context.build_bridge("virtual", &options).unwrap();
        let visible = bridge.enumerate();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].serial_number.as_deref(), Some("RF-42"));
        assert!(!bridge.is_connected());
    }

    #[test]
    fn test_unknown_backend() {
        let context = RegistrationContext::new();
        let err = context
            .build_bridge("ftdi", &BackendOptions::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unknown bridge backend"));
    }
}
