// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The sending and high-priority dispatch loops.
//!
//! Each entry runs on its own task so that a panicking command is
//! logged and the loop carries on with the next one.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use rfx_core::queue::marker::{run_logged, Action};
use rfx_core::queue::AwaitOutcome;
use rfx_core::{CommandEntry, Event, FlowGate, QueueMarker};

use super::Machine;
use crate::wait_for_shutdown;

pub(super) async fn run_send_loop(machine: Arc<Machine>, shutdown_rx: watch::Receiver<bool>) {
    info!("Send loop started");
    loop {
        let entry = tokio::select! {
            _ = wait_for_shutdown(shutdown_rx.clone()) => break,
            entry = async {
                machine.clear_to_send.wait().await;
                machine.send_queue.get().await
            } => entry,
        };
        machine.services.events.fire(Event::SendQueueUpdated {
            size: machine.send_queue.len(),
        });
        let what = entry.cmd_type.clone();
        let worker = machine.clone();
        if let Err(e) = tokio::spawn(async move { worker.dispatch(entry).await }).await {
            report_failure(what.as_deref().unwrap_or("command"), e);
        }
        machine.continue_sending();
    }
    info!("Send loop stopped");
}

pub(super) async fn run_high_priority_loop(machine: Arc<Machine>, shutdown_rx: watch::Receiver<bool>) {
    info!("High-priority loop started");
    loop {
        let entry = tokio::select! {
            _ = wait_for_shutdown(shutdown_rx.clone()) => break,
            entry = machine.hp_queue.get() => entry,
        };
        let what = entry.cmd_type.clone();
        let worker = machine.clone();
        if let Err(e) = tokio::spawn(async move { worker.dispatch_high_priority(entry).await }).await {
            report_failure(what.as_deref().unwrap_or("emergency command"), e);
        }
    }
    info!("High-priority loop stopped");
}

fn report_failure(what: &str, e: JoinError) {
    if e.is_panic() {
        error!("{}: dispatch panicked, continuing with the next entry", what);
    } else {
        warn!("{}: dispatch did not finish: {}", what, e);
    }
}

/// Lowers the gate for one transmission. Dropping it raises the gate
/// again, also while unwinding.
struct GateHold<'a>(&'a FlowGate);

impl<'a> GateHold<'a> {
    fn take(gate: &'a FlowGate) -> Self {
        gate.clear();
        Self(gate)
    }
}

impl Drop for GateHold<'_> {
    fn drop(&mut self) {
        self.0.set();
    }
}

impl Machine {
    /// Run one send-queue entry to completion. Failures are logged and
    /// never escape the loop.
    async fn dispatch(&self, entry: CommandEntry) {
        let CommandEntry {
            marker,
            cmd_type,
            on_sent,
            ..
        } = entry;
        let what = cmd_type.as_deref().unwrap_or("command");
        match marker {
            QueueMarker::Plain(action) => run_logged(action, what).await,
            QueueMarker::Send(action) => self.transmit(action, what).await,
            QueueMarker::AwaitCondition(mut condition) => {
                // taken before the callback, so a clear issued while it
                // runs still cancels the wait
                let mut cancel = self.cancel.subscribe();
                if let Some(callback) = condition.take_callback() {
                    self.transmit(callback, what).await;
                }
                let outcome = condition.wait(&mut cancel).await;
                if outcome != AwaitOutcome::Done {
                    debug!("{}: await marker finished as {:?}", what, outcome);
                }
            }
        }
        if let Some(on_sent) = on_sent {
            on_sent();
        }
    }

    async fn dispatch_high_priority(&self, entry: CommandEntry) {
        let CommandEntry {
            marker,
            cmd_type,
            on_sent,
            ..
        } = entry;
        let what = cmd_type.as_deref().unwrap_or("emergency command");
        match marker {
            QueueMarker::Plain(action) => run_logged(action, what).await,
            QueueMarker::Send(action) => {
                self.clear_to_send.wait().await;
                self.transmit(action, what).await;
            }
            QueueMarker::AwaitCondition(mut condition) => {
                if let Some(callback) = condition.take_callback() {
                    self.clear_to_send.wait().await;
                    self.transmit(callback, what).await;
                }
            }
        }
        if let Some(on_sent) = on_sent {
            on_sent();
        }
    }

    /// Put one action on the bus, holding the gate for its duration.
    async fn transmit(&self, action: Action, what: &str) {
        let _sending = self.sending.lock().await;
        let _hold = GateHold::take(&self.clear_to_send);
        run_logged(action, what).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{testing, SendOptions};
    use rfx_core::queue::AwaitCondition;
    use rfx_core::sync::lock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_failing_command_does_not_stop_loop() {
        let (machine, _bridge) = testing::running().await;
        let ran = Arc::new(AtomicUsize::new(0));
        machine
            .send_command(
                CommandEntry::new(QueueMarker::send(|| async { Err("bus exploded".into()) })),
                SendOptions::default(),
            )
            .unwrap();
        let counter = ran.clone();
        machine
            .send_command(
                CommandEntry::new(QueueMarker::send(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                SendOptions::default(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(machine.clear_to_send.is_set());
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_plain_marker_leaves_gate_untouched() {
        let (machine, _bridge) = testing::running().await;
        let observed = Arc::new(std::sync::Mutex::new(None));
        let slot = observed.clone();
        let gate_machine = machine.clone();
        machine
            .send_command(
                CommandEntry::new(QueueMarker::plain(move || async move {
                    *lock(&slot) = Some(gate_machine.clear_to_send.counter());
                    Ok(())
                })),
                SendOptions::default(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*lock(&observed), Some(1));
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_on_sent_fires_after_await_marker() {
        let (machine, _bridge) = testing::running().await;
        let done = Arc::new(AtomicBool::new(false));
        let sent = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let condition = AwaitCondition::new(move || {
            let flag = flag.clone();
            async move { Ok(flag.load(Ordering::SeqCst)) }
        })
        .with_interval(Duration::from_millis(5));
        let sent_flag = sent.clone();
        machine
            .send_command(
                CommandEntry::new(QueueMarker::AwaitCondition(condition))
                    .on_sent(move || sent_flag.store(true, Ordering::SeqCst)),
                SendOptions::default(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!sent.load(Ordering::SeqCst));
        done.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sent.load(Ordering::SeqCst));
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_cancels_in_flight_await() {
        let (machine, _bridge) = testing::running().await;
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let condition = AwaitCondition::new(|| async { Ok(false) })
            .with_interval(Duration::from_millis(10))
            .with_cancel(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
        machine
            .send_command(
                CommandEntry::new(QueueMarker::AwaitCondition(condition)),
                SendOptions::default(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        machine.command_queue_clear();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cancelled.load(Ordering::SeqCst));
        machine.shutdown().await;
    }

    fn counting_entry(counter: &Arc<AtomicUsize>) -> CommandEntry {
        let counter = counter.clone();
        CommandEntry::new(QueueMarker::send(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_panicking_command_does_not_stop_loop() {
        let (machine, _bridge) = testing::running().await;
        let ran = Arc::new(AtomicUsize::new(0));
        machine
            .send_command(
                CommandEntry::new(QueueMarker::send(|| async { panic!("driver bug") })),
                SendOptions::default(),
            )
            .unwrap();
        machine
            .send_command(counting_entry(&ran), SendOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(machine.clear_to_send.is_set());
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_hooks_do_not_stop_loops() {
        let (machine, _bridge) = testing::running().await;
        let ran = Arc::new(AtomicUsize::new(0));
        machine
            .send_command(
                CommandEntry::new(QueueMarker::send(|| async { Ok(()) })).on_sent(|| panic!("hook bug")),
                SendOptions::default(),
            )
            .unwrap();
        machine
            .send_command(counting_entry(&ran), SendOptions::default())
            .unwrap();
        machine
            .send_emergency_command(
                CommandEntry::new(QueueMarker::send(|| async { Ok(()) })).on_sent(|| panic!("hook bug")),
            )
            .unwrap();
        machine.send_emergency_command(counting_entry(&ran)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(machine.clear_to_send.is_set());
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_satisfied_await_marker_still_dispatches_callback() {
        let (machine, _bridge) = testing::running().await;
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let condition = AwaitCondition::new(|| async { Ok(true) }).with_callback(move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        machine
            .send_command(
                CommandEntry::new(QueueMarker::AwaitCondition(condition)),
                SendOptions::default(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(called.load(Ordering::SeqCst));
        machine.shutdown().await;
    }
}
