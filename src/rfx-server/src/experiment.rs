// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Experiment runner.
//!
//! An experiment is a cycle routine run as a machine job. Routines only
//! queue work on the job queue; the dispatch loops decide when it reaches
//! the bus, so manual commands keep priority over a running experiment.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rfx_core::registry::{arg_f64, opt_f64, CommandArgs, CommandError, CommandsInfo};
use rfx_core::sync::lock;
use rfx_core::{BoxFuture, CancelSignal, CancelWatch, Device, DynResult, Event};

use crate::devices::Vial;
use crate::error::ExperimentError;
use crate::machine::{Machine, Routing, SendOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Ready,
    Starting,
    Restoring,
    Running,
    Paused,
    Cancelling,
    Cancelled,
    Done,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Restoring => "restoring",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Cancelled | Self::Done | Self::Failed)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one routine cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub queued: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

pub trait Experiment: Send + Sync {
    fn name(&self) -> &str;

    /// Period of one cycle, measured from its start.
    fn cycle_time(&self) -> Duration;

    /// `None` runs until stopped or until `success_condition` holds.
    fn max_cycles(&self) -> Option<u32> {
        None
    }

    /// Reactors whose state follows the experiment.
    fn reactors(&self) -> &[Arc<Reactor>] {
        &[]
    }

    fn warmup<'a>(&'a self, _machine: &'a Machine) -> BoxFuture<'a, DynResult<()>> {
        Box::pin(async { Ok(()) })
    }

    /// One cycle. `abort` fires once the experiment is stopped.
    fn routine<'a>(
        &'a self,
        machine: &'a Machine,
        cycle: u32,
        abort: &'a CancelWatch,
    ) -> BoxFuture<'a, DynResult<CycleReport>>;

    fn success_condition(&self, _report: &CycleReport) -> bool {
        false
    }

    /// `Some(message)` fails the experiment.
    fn error_condition(&self, report: &CycleReport) -> Option<String> {
        report.error.clone()
    }

    fn cooldown<'a>(&'a self, _machine: &'a Machine) -> BoxFuture<'a, DynResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentInfo {
    pub id: Uuid,
    pub name: String,
    pub status: ExperimentStatus,
    pub cycles: u32,
    pub cycle_time_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Drives one experiment on a dedicated task.
pub struct ExperimentRunner {
    machine: Arc<Machine>,
    experiment: Arc<dyn Experiment>,
    info: Mutex<ExperimentInfo>,
    abort: CancelSignal,
    paused_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExperimentRunner {
    /// Put the machine into job mode and start from warmup.
    pub fn start(machine: Arc<Machine>, experiment: Arc<dyn Experiment>) -> Result<Arc<Self>, ExperimentError> {
        Self::launch(machine, experiment, 0, true)
    }

    /// Continue an interrupted experiment after `cycle`, skipping warmup.
    pub fn restore(
        machine: Arc<Machine>,
        experiment: Arc<dyn Experiment>,
        cycle: u32,
    ) -> Result<Arc<Self>, ExperimentError> {
        Self::launch(machine, experiment, cycle, false)
    }

    fn launch(
        machine: Arc<Machine>,
        experiment: Arc<dyn Experiment>,
        cycle: u32,
        warmup: bool,
    ) -> Result<Arc<Self>, ExperimentError> {
        machine.start_job()?;
        let info = ExperimentInfo {
            id: Uuid::new_v4(),
            name: experiment.name().to_string(),
            status: ExperimentStatus::Ready,
            cycles: cycle,
            cycle_time_secs: experiment.cycle_time().as_secs_f64(),
            started_at: Some(Utc::now()),
            ended_at: None,
            message: None,
        };
        let (paused_tx, _) = watch::channel(false);
        let runner = Arc::new(Self {
            machine,
            experiment,
            info: Mutex::new(info),
            abort: CancelSignal::new(),
            paused_tx,
            task: Mutex::new(None),
        });
        info!("Starting experiment {} ({})", runner.name(), runner.id());
        runner.set_status(if warmup {
            ExperimentStatus::Starting
        } else {
            ExperimentStatus::Restoring
        });

        let abort = runner.abort.subscribe();
        let task_runner = runner.clone();
        let handle = tokio::spawn(async move { task_runner.run(abort, warmup).await });
        *lock(&runner.task) = Some(handle);
        Ok(runner)
    }

    pub fn id(&self) -> Uuid {
        lock(&self.info).id
    }

    pub fn name(&self) -> String {
        lock(&self.info).name.clone()
    }

    pub fn status(&self) -> ExperimentStatus {
        lock(&self.info).status
    }

    pub fn info(&self) -> ExperimentInfo {
        lock(&self.info).clone()
    }

    pub fn pause(&self) -> Result<(), ExperimentError> {
        self.require_status("pause", ExperimentStatus::Running)?;
        self.set_reactors(ReactorState::Pausing);
        if let Err(e) = self.machine.pause_job() {
            self.set_reactors(ReactorState::Running);
            return Err(e.into());
        }
        self.paused_tx.send_replace(true);
        self.set_reactors(ReactorState::Paused);
        self.set_status(ExperimentStatus::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ExperimentError> {
        self.require_status("resume", ExperimentStatus::Paused)?;
        self.machine.resume_job()?;
        self.paused_tx.send_replace(false);
        self.set_reactors(ReactorState::Running);
        self.set_status(ExperimentStatus::Running);
        Ok(())
    }

    /// Abort the experiment and wait for its task, at most the machine's
    /// stop timeout. Idempotent.
    pub async fn stop(&self) {
        let status = self.status();
        if status.is_finished() || status == ExperimentStatus::Cancelling {
            return;
        }
        info!("Cancelling experiment {}", self.name());
        self.set_status(ExperimentStatus::Cancelling);
        self.set_reactors(ReactorState::Cancelling);
        self.abort.cancel();
        self.paused_tx.send_replace(false);
        // the in-flight await marker would otherwise hold the task
        self.machine.command_queue_clear();

        let timeout = self.machine.options().stop_timeout;
        let handle = lock(&self.task).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Experiment task failed: {}", e),
                Err(_) => {
                    warn!("Experiment did not stop within {:?}, aborting its task", timeout);
                    handle.abort();
                }
            }
        }
    }

    /// Wait for the experiment to end on its own.
    pub async fn join(&self) {
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Experiment task failed: {}", e);
            }
        }
    }

    async fn run(self: Arc<Self>, mut abort: CancelWatch, warmup: bool) {
        if self.status() != ExperimentStatus::Cancelling {
            self.set_status(ExperimentStatus::Running);
        }
        self.set_reactors(ReactorState::Running);

        if let Err(message) = self.run_cycles(&mut abort, warmup).await {
            error!("Experiment {} failed: {}", self.name(), message);
            lock(&self.info).message = Some(message.clone());
            self.machine.services().events.fire(Event::Error {
                error: self.name(),
                reason: message,
            });
            self.set_status(ExperimentStatus::Failed);
        }
        if let Err(e) = self.experiment.cooldown(&self.machine).await {
            warn!("Experiment {} cooldown failed: {}", self.name(), e);
        }

        let cancelled = abort.is_cancelled();
        let job = if cancelled {
            self.machine.cancel_job()
        } else {
            self.machine.finish_job()
        };
        if let Err(e) = job {
            warn!("Experiment {}: {}", self.name(), e);
        }

        lock(&self.info).ended_at = Some(Utc::now());
        self.set_reactors(ReactorState::Ready);
        let status = match self.status() {
            ExperimentStatus::Failed => ExperimentStatus::Failed,
            _ if cancelled => ExperimentStatus::Cancelled,
            _ => ExperimentStatus::Done,
        };
        self.set_status(status);
        info!("Experiment {} ended as {}", self.name(), status);
    }

    async fn run_cycles(&self, abort: &mut CancelWatch, warmup: bool) -> Result<(), String> {
        let experiment = self.experiment.clone();
        if warmup {
            experiment
                .warmup(&self.machine)
                .await
                .map_err(|e| format!("warmup failed: {e}"))?;
        }

        loop {
            if !self.wait_while_paused(abort).await {
                break;
            }
            let started = Instant::now();
            let cycle = {
                let mut info = lock(&self.info);
                info.cycles += 1;
                info.cycles
            };
            info!("{}: cycle {} started", experiment.name(), cycle);

            let report = experiment
                .routine(&self.machine, cycle, abort)
                .await
                .map_err(|e| format!("cycle {cycle}: {e}"))?;
            debug!(
                "{}: cycle {} queued {} commands, skipped {}",
                experiment.name(),
                cycle,
                report.queued,
                report.skipped
            );
            if let Some(message) = experiment.error_condition(&report) {
                return Err(message);
            }
            if experiment.success_condition(&report) {
                info!("{}: success condition reached", experiment.name());
                break;
            }
            if experiment.max_cycles().is_some_and(|max| max > 0 && cycle >= max) {
                break;
            }

            match experiment.cycle_time().checked_sub(started.elapsed()) {
                Some(remaining) => tokio::select! {
                    _ = abort.cancelled() => break,
                    _ = tokio::time::sleep(remaining) => {}
                },
                None => warn!(
                    "{}: cycle {} took {:?}, longer than the cycle time",
                    experiment.name(),
                    cycle,
                    started.elapsed()
                ),
            }
        }
        Ok(())
    }

    /// Park while paused. `false` once aborted.
    async fn wait_while_paused(&self, abort: &mut CancelWatch) -> bool {
        let mut paused = self.paused_tx.subscribe();
        loop {
            if abort.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = abort.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn require_status(&self, action: &'static str, expected: ExperimentStatus) -> Result<(), ExperimentError> {
        let status = self.status();
        if status != expected {
            return Err(ExperimentError::InvalidStatus { action, status });
        }
        Ok(())
    }

    fn set_status(&self, status: ExperimentStatus) {
        let name = {
            let mut info = lock(&self.info);
            if info.status == status {
                return;
            }
            info.status = status;
            info.name.clone()
        };
        debug!("Experiment {} is now {}", name, status);
        self.machine.services().events.fire(Event::ExperimentStatusChanged {
            experiment: name,
            status: status.as_str().to_string(),
        });
    }

    /// Reactors in error keep their state until reset.
    fn set_reactors(&self, state: ReactorState) {
        for reactor in self.experiment.reactors() {
            if reactor.state() != ReactorState::Error {
                reactor.set_state(state);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactorState {
    Ready,
    Running,
    Paused,
    Cancelling,
    Pausing,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactorData {
    pub id: String,
    pub vial: u8,
    pub state: ReactorState,
    pub error: String,
    pub volume: f64,
    pub commands: CommandsInfo,
}

const REACTOR_COMMANDS: &[(&str, &[&str])] = &[
    ("measure_od", &[]),
    ("measure_temperature", &[]),
    ("add_media", &["volume", "speed"]),
    ("add_drug", &["volume", "speed"]),
    ("waste", &["volume", "speed"]),
];

/// Experiment-facing view of one vial.
pub struct Reactor {
    vial: Arc<Vial>,
    state: Mutex<ReactorState>,
    error: Mutex<String>,
}

impl Reactor {
    pub fn new(vial: Arc<Vial>) -> Self {
        Self {
            vial,
            state: Mutex::new(ReactorState::Ready),
            error: Mutex::new(String::new()),
        }
    }

    pub fn for_machine(machine: &Machine) -> Vec<Arc<Reactor>> {
        machine
            .vials()
            .iter()
            .map(|vial| Arc::new(Reactor::new(vial.clone())))
            .collect()
    }

    pub fn id(&self) -> &str {
        self.vial.id()
    }

    pub fn state(&self) -> ReactorState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: ReactorState) {
        *lock(&self.state) = state;
    }

    pub fn error(&self) -> String {
        lock(&self.error).clone()
    }

    /// Clear an error and return to `Ready`.
    pub fn reset(&self) {
        lock(&self.error).clear();
        self.set_state(ReactorState::Ready);
    }

    pub fn accepts_commands(&self) -> bool {
        matches!(self.state(), ReactorState::Ready | ReactorState::Running)
    }

    pub fn commands_info(&self) -> CommandsInfo {
        REACTOR_COMMANDS
            .iter()
            .map(|(name, params)| (name.to_string(), params.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    pub fn data(&self) -> ReactorData {
        ReactorData {
            id: self.id().to_string(),
            vial: self.vial.number(),
            state: self.state(),
            error: self.error(),
            volume: self.vial.volume(),
            commands: self.commands_info(),
        }
    }

    /// Route a reactor command to the matching machine verb. A rejected
    /// command puts the reactor in `Error`.
    pub fn cmd(
        &self,
        machine: &Machine,
        command: &str,
        args: &CommandArgs,
        options: SendOptions,
    ) -> DynResult<Routing> {
        let routed = match command {
            "measure_od" => machine.measure_od(&self.vial.od_sensor_id(), options),
            "measure_temperature" => match self.vial.thermometer_id() {
                Some(thermometer) => machine.measure_temperature(thermometer, options),
                None => return Err(format!("{}: no thermometer fitted", self.id()).into()),
            },
            "add_media" => machine.vial_add_media(self.id(), arg_f64(args, "volume")?, opt_f64(args, "speed")?, options),
            "add_drug" => machine.vial_add_drug(self.id(), arg_f64(args, "volume")?, opt_f64(args, "speed")?, options),
            "waste" => machine.vial_waste(self.id(), arg_f64(args, "volume")?, opt_f64(args, "speed")?, options),
            other => return Err(CommandError::Unknown(other.to_string()).into()),
        };
        routed.map_err(|e| {
            *lock(&self.error) = e.to_string();
            self.set_state(ReactorState::Error);
            e.into()
        })
    }
}

/// Periodic OD and temperature sampling of every vial.
pub struct OdMeasureExperiment {
    reactors: Vec<Arc<Reactor>>,
    cycle_time: Duration,
    max_cycles: Option<u32>,
}

impl OdMeasureExperiment {
    pub const NAME: &'static str = "od-measure";

    pub fn new(machine: &Machine, cycle_time: Duration, max_cycles: Option<u32>) -> Self {
        Self {
            reactors: Reactor::for_machine(machine),
            cycle_time,
            max_cycles,
        }
    }
}

impl Experiment for OdMeasureExperiment {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn cycle_time(&self) -> Duration {
        self.cycle_time
    }

    fn max_cycles(&self) -> Option<u32> {
        self.max_cycles
    }

    fn reactors(&self) -> &[Arc<Reactor>] {
        &self.reactors
    }

    fn routine<'a>(
        &'a self,
        machine: &'a Machine,
        _cycle: u32,
        abort: &'a CancelWatch,
    ) -> BoxFuture<'a, DynResult<CycleReport>> {
        Box::pin(async move {
            let mut report = CycleReport::default();
            let args = CommandArgs::new();
            for reactor in &self.reactors {
                if abort.is_cancelled() {
                    break;
                }
                if !reactor.accepts_commands() {
                    warn!("{} is not ready, skipping", reactor.id());
                    report.skipped += 1;
                    continue;
                }
                for command in ["measure_od", "measure_temperature"] {
                    if let Err(e) = reactor.cmd(machine, command, &args, SendOptions::experiment()) {
                        report.error = Some(format!("{}: {}", reactor.id(), e));
                        return Ok(report);
                    }
                    report.queued += 1;
                }
            }
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing;
    use rfx_core::DeviceState;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts cycles and queues nothing.
    struct Counter {
        cycles: AtomicU32,
        max_cycles: Option<u32>,
        fail_at: Option<u32>,
    }

    impl Counter {
        fn new(max_cycles: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                cycles: AtomicU32::new(0),
                max_cycles,
                fail_at: None,
            })
        }
    }

    impl Experiment for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn cycle_time(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn max_cycles(&self) -> Option<u32> {
            self.max_cycles
        }

        fn routine<'a>(
            &'a self,
            _machine: &'a Machine,
            cycle: u32,
            _abort: &'a CancelWatch,
        ) -> BoxFuture<'a, DynResult<CycleReport>> {
            Box::pin(async move {
                self.cycles.fetch_add(1, Ordering::SeqCst);
                let error = (self.fail_at == Some(cycle)).then(|| "culture contaminated".to_string());
                Ok(CycleReport {
                    error,
                    ..CycleReport::default()
                })
            })
        }
    }

    #[tokio::test]
    async fn test_runs_max_cycles_then_finishes_job() {
        let (machine, _bridge) = testing::running().await;
        let experiment = Counter::new(Some(3));
        let runner = ExperimentRunner::start(machine.clone(), experiment.clone()).unwrap();
        assert_eq!(machine.state(), DeviceState::Working);
        runner.join().await;

        assert_eq!(experiment.cycles.load(Ordering::SeqCst), 3);
        let info = runner.info();
        assert_eq!(info.status, ExperimentStatus::Done);
        assert_eq!(info.cycles, 3);
        assert!(info.ended_at.is_some());
        assert_eq!(machine.state(), DeviceState::Operational);
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_condition_fails_experiment() {
        let (machine, _bridge) = testing::running().await;
        let experiment = Arc::new(Counter {
            cycles: AtomicU32::new(0),
            max_cycles: None,
            fail_at: Some(2),
        });
        let runner = ExperimentRunner::start(machine.clone(), experiment.clone()).unwrap();
        runner.join().await;

        let info = runner.info();
        assert_eq!(info.status, ExperimentStatus::Failed);
        assert_eq!(info.message.as_deref(), Some("culture contaminated"));
        assert_eq!(experiment.cycles.load(Ordering::SeqCst), 2);
        assert_eq!(machine.state(), DeviceState::Operational);
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_and_returns_to_manual_control() {
        let (machine, _bridge) = testing::running().await;
        let mut events = machine.services().events.subscribe();
        let runner = ExperimentRunner::start(machine.clone(), Counter::new(None)).unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;
        runner.stop().await;
        runner.stop().await;

        assert_eq!(runner.status(), ExperimentStatus::Cancelled);
        assert_eq!(machine.state(), DeviceState::Operational);

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::ExperimentStatusChanged { status, .. } = event {
                statuses.push(status);
            }
        }
        assert_eq!(statuses, ["starting", "running", "cancelling", "cancelled"]);
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_holds_cycles() {
        let (machine, _bridge) = testing::running().await;
        let experiment = Counter::new(None);
        let runner = ExperimentRunner::start(machine.clone(), experiment.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        runner.pause().unwrap();
        assert_eq!(machine.state(), DeviceState::Paused);
        assert!(machine.jobs_on_hold());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let paused_at = experiment.cycles.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(experiment.cycles.load(Ordering::SeqCst), paused_at);
        assert!(matches!(
            runner.pause(),
            Err(ExperimentError::InvalidStatus {
                status: ExperimentStatus::Paused,
                ..
            })
        ));

        runner.resume().unwrap();
        assert_eq!(machine.state(), DeviceState::Working);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(experiment.cycles.load(Ordering::SeqCst) > paused_at);
        runner.stop().await;
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_requires_operational_machine() {
        let (machine, _bridge) = testing::machine_with(testing::options());
        let err = ExperimentRunner::start(machine.clone(), Counter::new(Some(1))).err();
        assert!(matches!(err, Some(ExperimentError::Machine(_))));
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_skips_to_cycle() {
        let (machine, _bridge) = testing::running().await;
        let runner = ExperimentRunner::restore(machine.clone(), Counter::new(Some(5)), 3).unwrap();
        runner.join().await;
        assert_eq!(runner.info().cycles, 5);
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_od_measure_samples_every_vial() {
        let (machine, _bridge) = testing::running().await;
        let experiment = Arc::new(OdMeasureExperiment::new(&machine, Duration::from_millis(10), Some(1)));
        let runner = ExperimentRunner::start(machine.clone(), experiment.clone()).unwrap();
        runner.join().await;
        assert_eq!(runner.status(), ExperimentStatus::Done);

        tokio::time::sleep(Duration::from_millis(400)).await;
        for vial in machine.vials() {
            let sensor = machine.od_sensor(&vial.od_sensor_id()).unwrap();
            assert!(sensor.od().is_some(), "{} not sampled", sensor.id());
        }
        assert!(experiment.reactors().iter().all(|r| r.state() == ReactorState::Ready));
        machine.shutdown().await;
    }

    #[tokio::test]
    async fn test_reactor_rejects_unknown_command() {
        let (machine, _bridge) = testing::running().await;
        let reactor = Reactor::for_machine(&machine).remove(0);
        let err = reactor
            .cmd(&machine, "centrifuge", &CommandArgs::new(), SendOptions::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown command 'centrifuge'");
        assert_eq!(reactor.state(), ReactorState::Ready);

        let data = reactor.data();
        assert_eq!(data.id, "vial-1");
        assert_eq!(data.commands["add_media"], ["volume", "speed"]);
        machine.shutdown().await;
    }
}
