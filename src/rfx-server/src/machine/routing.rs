// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Command routing between the job, command and send queues.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use rfx_core::registry::{opt_bool, CommandArgs, CommandError};
use rfx_core::sync::lock;
use rfx_core::{CommandEntry, DeviceState, Event, SendTarget};

use super::lifecycle::ConnectionState;
use super::Machine;
use crate::error::MachineError;

pub const EXPERIMENT_TAG: &str = "source:experiment";

/// Where a command ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    Job,
    Command,
    Direct,
    /// Rejected as a duplicate of a queued command.
    Dropped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub part_of_experiment: bool,
    /// Dispatch directly even while a job is running.
    pub force: bool,
    pub tags: Vec<String>,
}

impl SendOptions {
    pub fn experiment() -> Self {
        Self {
            part_of_experiment: true,
            ..Self::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Read `part_of_experiment`, `force` and `tags` from command args.
    pub fn from_args(args: &CommandArgs) -> Result<Self, CommandError> {
        let tags = match args.get("tags") {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|tag| {
                    tag.as_str().map(str::to_string).ok_or_else(|| CommandError::InvalidArg {
                        name: "tags".to_string(),
                        reason: format!("expected strings, got {tag}"),
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(CommandError::InvalidArg {
                    name: "tags".to_string(),
                    reason: format!("expected a list, got {other}"),
                })
            }
        };
        Ok(Self {
            part_of_experiment: opt_bool(args, "part_of_experiment")?.unwrap_or(false),
            force: opt_bool(args, "force")?.unwrap_or(false),
            tags,
        })
    }
}

impl Machine {
    pub fn send_command(&self, entry: CommandEntry, options: SendOptions) -> Result<Routing, MachineError> {
        self.send_commands(vec![entry], options)
    }

    /// Route a batch as one unit: no other command can be enqueued
    /// between its entries, and a duplicate type drops the whole batch.
    pub fn send_commands(
        &self,
        entries: Vec<CommandEntry>,
        options: SendOptions,
    ) -> Result<Routing, MachineError> {
        let routing = {
            let _enqueue = lock(&self.enqueue);
            let entries: Vec<CommandEntry> = entries
                .into_iter()
                .map(|entry| entry.with_tags(options.tags.iter().cloned()))
                .collect();
            let state = self.state();

            if options.part_of_experiment {
                self.job_queue
                    .put_all(entries.into_iter().map(|entry| entry.with_tag(EXPERIMENT_TAG)));
                self.services.events.fire(Event::JobQueueUpdated {
                    size: self.job_queue.len(),
                });
                Routing::Job
            } else if state.is_working() && !options.force {
                self.enqueue_manual(entries)
            } else if state.is_operational() || options.force {
                if self.connection_state() != ConnectionState::Operational {
                    return Err(MachineError::NotConnected);
                }
                let items = entries
                    .into_iter()
                    .map(|entry| {
                        let cmd_type = entry.cmd_type.clone();
                        (entry, cmd_type)
                    })
                    .collect();
                match self.send_queue.put_batch(items, SendTarget::Send) {
                    Ok(()) => {
                        self.services.events.fire(Event::SendQueueUpdated {
                            size: self.send_queue.len(),
                        });
                        Routing::Direct
                    }
                    Err(e) => {
                        debug!("Dropping command: {}", e);
                        Routing::Dropped
                    }
                }
            } else {
                return Err(MachineError::InvalidTransition {
                    action: "send a command",
                    state,
                });
            }
        };
        if routing != Routing::Dropped {
            self.continue_sending();
        }
        Ok(routing)
    }

    fn enqueue_manual(&self, entries: Vec<CommandEntry>) -> Routing {
        let mut seen = HashSet::new();
        for entry in &entries {
            if let Some(cmd_type) = &entry.cmd_type {
                if self.command_queue.contains_type(cmd_type) || !seen.insert(cmd_type.clone()) {
                    debug!("Command of type '{}' is already in queue, dropping", cmd_type);
                    return Routing::Dropped;
                }
            }
        }
        for entry in entries {
            let cmd_type = entry.cmd_type.clone();
            if let Err(e) = self.command_queue.put(entry, cmd_type.as_deref()) {
                debug!("Dropping command: {}", e);
            }
        }
        self.services.events.fire(Event::CommandQueueUpdated {
            size: self.command_queue.len(),
        });
        Routing::Command
    }

    /// Bypass every normal queue through the high-priority loop.
    pub fn send_emergency_command(&self, entry: CommandEntry) -> Result<Routing, MachineError> {
        let cmd_type = entry.cmd_type.clone();
        match self.hp_queue.put(entry, cmd_type.as_deref(), SendTarget::Send) {
            Ok(()) => Ok(Routing::Direct),
            Err(e) => {
                debug!("Dropping emergency command: {}", e);
                Ok(Routing::Dropped)
            }
        }
    }

    /// Refill the send queue from the command queue, then the job
    /// queue. Manual commands ignore the job hold. Returns whether the
    /// send queue has something to dispatch.
    pub(crate) fn continue_sending(&self) -> bool {
        let _continuing = lock(&self.continuing);
        if self.connection_state() != ConnectionState::Operational {
            return false;
        }
        loop {
            if !self.send_queue.is_empty() {
                return true;
            }
            let (entry, queue) = if let Some(entry) = self.command_queue.try_get() {
                self.services.events.fire(Event::CommandQueueUpdated {
                    size: self.command_queue.len(),
                });
                (entry, "command")
            } else if self.job_on_hold.is_set() {
                return false;
            } else if let Some(entry) = self.job_queue.try_get() {
                self.services.events.fire(Event::JobQueueUpdated {
                    size: self.job_queue.len(),
                });
                (entry, "job")
            } else {
                return false;
            };
            let cmd_type = entry.cmd_type.clone();
            if let Err(e) = self.send_queue.put(entry, cmd_type.as_deref(), SendTarget::Send) {
                debug!("Dropping {} queue entry: {}", queue, e);
                continue;
            }
            self.services.events.fire(Event::SendQueueUpdated {
                size: self.send_queue.len(),
            });
        }
    }

    /// Empty the job, command and send queues and cancel whatever
    /// await marker is in flight.
    pub fn command_queue_clear(&self) {
        let _enqueue = lock(&self.enqueue);
        let dropped =
            self.job_queue.clear().len() + self.command_queue.clear().len() + self.send_queue.clear().len();
        self.cancel.cancel();
        info!("Command queues cleared ({} entries dropped)", dropped);
        for event in [
            Event::JobQueueUpdated { size: 0 },
            Event::CommandQueueUpdated { size: 0 },
            Event::SendQueueUpdated { size: 0 },
        ] {
            self.services.events.fire(event);
        }
    }

    pub fn hold_jobs(&self) {
        self.job_on_hold.set();
        debug!("Job queue on hold ({})", self.job_on_hold.counter());
    }

    pub fn release_jobs(&self) {
        self.job_on_hold.clear();
        debug!("Job queue hold released ({})", self.job_on_hold.counter());
        self.continue_sending();
    }

    pub fn jobs_on_hold(&self) -> bool {
        self.job_on_hold.is_set()
    }

    pub(crate) fn require_state(&self, action: &'static str, allowed: &[DeviceState]) -> Result<DeviceState, MachineError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(MachineError::InvalidTransition { action, state })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing;
    use rfx_core::QueueMarker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn noop(cmd_type: &str) -> CommandEntry {
        CommandEntry::new(QueueMarker::send(|| async { Ok(()) })).with_type(cmd_type)
    }

    #[test]
    fn test_send_options_from_args() {
        let args = json!({"force": true, "tags": ["source:api"]})
            .as_object()
            .cloned()
            .unwrap();
        let options = SendOptions::from_args(&args).unwrap();
        assert!(options.force);
        assert!(!options.part_of_experiment);
        assert_eq!(options.tags, vec!["source:api".to_string()]);
        let args = json!({"tags": "x"}).as_object().cloned().unwrap();
        assert!(SendOptions::from_args(&args).is_err());
    }

    #[tokio::test]
    async fn test_offline_machine_rejects_commands() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        let err = machine
            .send_command(noop("a"), SendOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            MachineError::InvalidTransition {
                action: "send a command",
                state: DeviceState::Offline
            }
        );
        assert_eq!(
            machine.send_command(noop("a"), SendOptions::forced()),
            Err(MachineError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_experiment_commands_go_to_job_queue() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        let routing = machine
            .send_command(noop("measure"), SendOptions::experiment())
            .unwrap();
        assert_eq!(routing, Routing::Job);
        let entry = machine.job_queue.try_get().unwrap();
        assert!(entry.tags.contains(EXPERIMENT_TAG));
    }

    #[tokio::test]
    async fn test_working_routes_to_command_queue_and_drops_duplicates() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        machine.set_state(DeviceState::Working);
        let tagged = SendOptions::default().with_tag("source:api");
        assert_eq!(machine.send_command(noop("stir"), tagged).unwrap(), Routing::Command);
        assert_eq!(
            machine.send_command(noop("stir"), SendOptions::default()).unwrap(),
            Routing::Dropped
        );
        assert_eq!(machine.queue_sizes().command, 1);
        assert!(machine.command_queue.try_get().unwrap().tags.contains("source:api"));
    }

    #[tokio::test]
    async fn test_batch_with_duplicate_type_dropped_whole() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        machine.set_state(DeviceState::Working);
        let batch = vec![noop("a"), noop("b"), noop("a")];
        assert_eq!(
            machine.send_commands(batch, SendOptions::default()).unwrap(),
            Routing::Dropped
        );
        assert_eq!(machine.queue_sizes().command, 0);
    }

    #[tokio::test]
    async fn test_command_queue_preempts_job_queue() {
        let (machine, _bridge) = testing::running().await;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        machine.hold_jobs();
        machine.set_state(DeviceState::Working);
        for (name, options) in [
            ("job-1", SendOptions::experiment()),
            ("manual", SendOptions::default()),
            ("job-2", SendOptions::experiment()),
        ] {
            let order = order.clone();
            let entry = CommandEntry::new(QueueMarker::send(move || async move {
                lock(&order).push(name);
                Ok(())
            }));
            machine.send_command(entry, options).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // manual commands ignore the hold
        assert_eq!(*lock(&order), vec!["manual"]);

        machine.release_jobs();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*lock(&order), vec!["manual", "job-1", "job-2"]);
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_empties_all_queues() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        machine.set_state(DeviceState::Working);
        machine.send_command(noop("a"), SendOptions::default()).unwrap();
        machine.send_command(noop("b"), SendOptions::experiment()).unwrap();
        machine.send_queue.put(noop("c"), Some("c"), SendTarget::Send).unwrap();
        machine.command_queue_clear();
        assert_eq!(machine.queue_sizes(), crate::machine::QueueSizes::default());
    }

    #[tokio::test]
    async fn test_emergency_bypasses_busy_send_loop() {
        let (machine, _bridge) = testing::running().await;
        let ran = Arc::new(AtomicUsize::new(0));
        // occupy the send loop with an endless await marker
        let blocker = rfx_core::queue::AwaitCondition::new(|| async { Ok(false) })
            .with_interval(Duration::from_millis(10));
        machine
            .send_command(
                CommandEntry::new(QueueMarker::AwaitCondition(blocker)),
                SendOptions::default(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let counter = ran.clone();
        machine
            .send_emergency_command(CommandEntry::new(QueueMarker::send(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        machine.command_queue_clear();
        machine.shutdown().await;
    }
}
