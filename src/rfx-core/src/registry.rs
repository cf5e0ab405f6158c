// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Explicit command registries.
//!
//! Each device (and the machine) registers its named commands at
//! construction time: a parameter list for introspection, an optional
//! validation rule and the handler itself.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::{BoxFuture, DynResult};

pub type CommandArgs = serde_json::Map<String, Value>;

/// Command name mapped to its ordered parameter names.
pub type CommandsInfo = BTreeMap<String, Vec<String>>;

pub type HandlerFuture<'a> = BoxFuture<'a, DynResult<Value>>;

pub type Handler<D> = for<'a> fn(&'a D, &'a CommandArgs) -> HandlerFuture<'a>;

pub type Validator<D> = fn(&D, &CommandArgs) -> ValidationResult;

/// Result of command validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Command can be executed.
    Ok,
    /// Command cannot be executed in the current state.
    InvalidState(String),
    /// Command parameters are invalid.
    InvalidParams(String),
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("missing argument '{0}'")]
    MissingArg(String),
    #[error("invalid argument '{name}': {reason}")]
    InvalidArg { name: String, reason: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

pub struct CommandSpec<D> {
    pub name: &'static str,
    pub params: &'static [&'static str],
    validator: Option<Validator<D>>,
    handler: Handler<D>,
}

pub struct CommandRegistry<D> {
    specs: Vec<CommandSpec<D>>,
}

impl<D> Default for CommandRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> CommandRegistry<D> {
    pub fn new() -> Self {
        Self { specs: Vec::new() }
    }

    /// Register a command. A later registration under the same name
    /// replaces the earlier one.
    pub fn register(
        mut self,
        name: &'static str,
        params: &'static [&'static str],
        handler: Handler<D>,
    ) -> Self {
        self.insert(CommandSpec {
            name,
            params,
            validator: None,
            handler,
        });
        self
    }

    pub fn register_validated(
        mut self,
        name: &'static str,
        params: &'static [&'static str],
        validator: Validator<D>,
        handler: Handler<D>,
    ) -> Self {
        self.insert(CommandSpec {
            name,
            params,
            validator: Some(validator),
            handler,
        });
        self
    }

    fn insert(&mut self, spec: CommandSpec<D>) {
        self.specs.retain(|s| s.name != spec.name);
        self.specs.push(spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec<D>> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.iter().map(|s| s.name)
    }

    pub fn info(&self) -> CommandsInfo {
        self.specs
            .iter()
            .map(|s| {
                let params = s.params.iter().map(|p| p.to_string()).collect();
                (s.name.to_string(), params)
            })
            .collect()
    }

    pub fn validate(&self, device: &D, name: &str, args: &CommandArgs) -> Result<(), CommandError> {
        let spec = self
            .get(name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        match spec.validator.map(|v| v(device, args)) {
            None | Some(ValidationResult::Ok) => Ok(()),
            Some(ValidationResult::InvalidState(msg)) => Err(CommandError::InvalidState(msg)),
            Some(ValidationResult::InvalidParams(msg)) => Err(CommandError::InvalidParams(msg)),
        }
    }
}

impl<D: Sync> CommandRegistry<D> {
    /// Validate then run a command by name.
    pub fn dispatch<'a>(
        &'a self,
        device: &'a D,
        name: &'a str,
        args: &'a CommandArgs,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.validate(device, name, args)?;
            let spec = self
                .get(name)
                .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
            (spec.handler)(device, args).await
        })
    }
}

pub fn arg_f64(args: &CommandArgs, name: &str) -> Result<f64, CommandError> {
    opt_f64(args, name)?.ok_or_else(|| CommandError::MissingArg(name.to_string()))
}

pub fn opt_f64(args: &CommandArgs, name: &str) -> Result<Option<f64>, CommandError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| CommandError::InvalidArg {
            name: name.to_string(),
            reason: format!("expected a number, got {value}"),
        }),
    }
}

pub fn arg_str<'a>(args: &'a CommandArgs, name: &str) -> Result<&'a str, CommandError> {
    match args.get(name) {
        None | Some(Value::Null) => Err(CommandError::MissingArg(name.to_string())),
        Some(Value::String(s)) => Ok(s),
        Some(value) => Err(CommandError::InvalidArg {
            name: name.to_string(),
            reason: format!("expected a string, got {value}"),
        }),
    }
}

pub fn opt_bool(args: &CommandArgs, name: &str) -> Result<Option<bool>, CommandError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(value) => Err(CommandError::InvalidArg {
            name: name.to_string(),
            reason: format!("expected a boolean, got {value}"),
        }),
    }
}
