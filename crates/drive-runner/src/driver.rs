//! The evaluation loop: wait for the next scheduled checkpoint, bring up a
//! simulator, run the benchmark against it, aggregate and persist one row
//! per task, tear the simulator down, repeat.
//!
//! All progress lives in the summary logs. A run that dies at any point can
//! be restarted with the same arguments and picks up at the first checkpoint
//! without a row in the reference task's log.

use crate::aggregate::aggregate;
use crate::benchmark::{BenchmarkInvocation, BenchmarkResult, BenchmarkRunner, Checkpoint, EvalAgent};
use crate::cancel::CancelToken;
use crate::config::{DriveCondition, DriveParams, ExperimentConfig, RunPaths, SimulatorPolicy};
use crate::error::EvalError;
use crate::run_log::RunLog;
use crate::schedule::{maximum_checkpoint_reached, CheckpointScheduler};
use crate::suites::{BenchmarkSuite, SuiteId, TaskList};
use crate::summary::SummaryLog;
use crate::supervisor::{LaunchRequest, ProcessHandle, SimulatorSupervisor};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::cell::Cell;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Give up waiting after this long without a ready checkpoint. `None`
    /// waits until the schedule is exhausted.
    pub idle_timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    AwaitingCheckpoint,
    SimulatorStarting,
    Benchmarking,
    Aggregating,
    Persisting,
    Finished,
    FatalError,
}

impl std::fmt::Display for DriveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriveState::AwaitingCheckpoint => "awaiting_checkpoint",
            DriveState::SimulatorStarting => "simulator_starting",
            DriveState::Benchmarking => "benchmarking",
            DriveState::Aggregating => "aggregating",
            DriveState::Persisting => "persisting",
            DriveState::Finished => "finished",
            DriveState::FatalError => "fatal_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Every scheduled checkpoint has a summary row.
    Finished,
    /// The idle timeout expired while waiting for `latest`'s successor.
    Idle { latest: Option<u64> },
}

/// Owns a live simulator and stops it exactly once, on whichever path
/// leaves the scope.
struct SimulatorGuard<'a, S: SimulatorSupervisor> {
    supervisor: &'a S,
    handle: Option<ProcessHandle>,
}

impl<'a, S: SimulatorSupervisor> SimulatorGuard<'a, S> {
    fn new(supervisor: &'a S, handle: ProcessHandle) -> Self {
        Self {
            supervisor,
            handle: Some(handle),
        }
    }

    fn port(&self) -> u16 {
        self.handle.as_ref().map(ProcessHandle::port).unwrap_or(0)
    }
}

impl<S: SimulatorSupervisor> Drop for SimulatorGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(port = handle.port(), "stopping simulator");
            self.supervisor.stop(handle);
        }
    }
}

pub struct EvaluationDriver<S: SimulatorSupervisor, B: BenchmarkRunner> {
    config: ExperimentConfig,
    params: DriveParams,
    paths: RunPaths,
    condition: DriveCondition,
    suite: Box<dyn BenchmarkSuite>,
    tasks: TaskList,
    summary: SummaryLog,
    scheduler: CheckpointScheduler,
    supervisor: S,
    runner: B,
    poll: PollPolicy,
    cancel: CancelToken,
    run_log: RunLog,
    state: Cell<DriveState>,
}

impl<S: SimulatorSupervisor, B: BenchmarkRunner> EvaluationDriver<S, B> {
    pub fn new(
        config: ExperimentConfig,
        params: DriveParams,
        paths: RunPaths,
        condition: DriveCondition,
        supervisor: S,
        runner: B,
    ) -> Result<Self> {
        let suite = SuiteId::parse(&condition.suite)?.build();
        let tasks = suite.task_list();
        let reference = tasks
            .reference()
            .ok_or_else(|| anyhow!("empty_suite: {} defines no tasks", suite.id()))?
            .to_string();
        let summary = SummaryLog::new(paths.summary_base(config.control_filename()));
        let scheduler = CheckpointScheduler::for_summary(
            config.test_schedule.clone(),
            &summary,
            &reference,
            &paths.checkpoints_dir(),
            &config.checkpoint_extension,
        );
        let run_log = RunLog::new(paths.run_log_path());
        Ok(Self {
            config,
            params,
            paths,
            condition,
            suite,
            tasks,
            summary,
            scheduler,
            supervisor,
            runner,
            poll: PollPolicy::default(),
            cancel: CancelToken::new(),
            run_log,
            state: Cell::new(DriveState::AwaitingCheckpoint),
        })
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> DriveState {
        self.state.get()
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    pub fn scheduler(&self) -> &CheckpointScheduler {
        &self.scheduler
    }

    pub fn summary_log(&self) -> &SummaryLog {
        &self.summary
    }

    fn transition(&self, next: DriveState) {
        let prev = self.state.replace(next);
        if prev != next {
            debug!(from = %prev, state = %next, "driver state");
        }
    }

    fn run_name(&self, iteration: u64) -> String {
        format!(
            "{}_{}_{}_drive_{}",
            self.paths.batch,
            self.paths.alias,
            iteration,
            self.config.control_filename()
        )
    }

    fn launch_request(&self) -> LaunchRequest {
        LaunchRequest {
            gpu: self.params.gpu.clone(),
            town: self.condition.town.clone(),
            no_screen: self.params.no_screen,
            docker: self.params.docker,
        }
    }

    /// Run until the schedule is exhausted, the idle timeout expires, or a
    /// failure ends the run.
    pub fn run(&self) -> Result<DriveOutcome, EvalError> {
        let poses = self
            .suite
            .build_experiments()
            .first()
            .map(|e| e.poses.clone())
            .unwrap_or_default();
        self.run_log
            .add_message("Loading", json!({ "Poses": poses }), None)?;
        info!(
            condition = %self.condition,
            tasks = self.tasks.len(),
            schedule_len = self.scheduler.schedule().entries().len(),
            "evaluation driver started"
        );

        if self.scheduler.latest_evaluated()?.is_none() {
            for (_, task) in self.tasks.iter() {
                self.summary.write_header(task)?;
            }
        }

        let mut simulator: Option<SimulatorGuard<'_, S>> = None;
        let mut idle_since = Instant::now();
        loop {
            self.transition(DriveState::AwaitingCheckpoint);
            self.cancel.check()?;
            let latest = self.scheduler.latest_evaluated()?;
            if maximum_checkpoint_reached(latest, self.scheduler.schedule()) {
                self.transition(DriveState::Finished);
                info!(?latest, "all scheduled checkpoints evaluated");
                return Ok(DriveOutcome::Finished);
            }
            if !self.scheduler.is_next_checkpoint_ready()? {
                if let Some(limit) = self.poll.idle_timeout {
                    if idle_since.elapsed() >= limit {
                        info!(?latest, "no checkpoint became ready before the idle timeout");
                        return Ok(DriveOutcome::Idle { latest });
                    }
                }
                self.cancel.sleep(self.poll.interval)?;
                continue;
            }
            let Some(iteration) = self.scheduler.next_checkpoint()? else {
                continue;
            };

            let port = match simulator.as_ref() {
                Some(guard) => guard.port(),
                None => {
                    self.transition(DriveState::SimulatorStarting);
                    let handle = self.supervisor.start(&self.launch_request())?;
                    let guard = SimulatorGuard::new(&self.supervisor, handle);
                    let port = guard.port();
                    simulator = Some(guard);
                    port
                }
            };
            self.evaluate_checkpoint(iteration, port)?;

            if self.params.simulator_policy == SimulatorPolicy::RelaunchPerCheckpoint {
                simulator = None;
            }
            idle_since = Instant::now();
        }
    }

    fn evaluate_checkpoint(&self, iteration: u64, port: u16) -> Result<(), EvalError> {
        self.transition(DriveState::Benchmarking);
        let checkpoint = Checkpoint::load(iteration, &self.scheduler.checkpoint_path(iteration))?;
        let invocation = BenchmarkInvocation {
            agent: EvalAgent {
                checkpoint,
                town: self.condition.town.clone(),
                record_collisions: self.params.record_collisions,
            },
            suite: self.suite.id(),
            run_name: self.run_name(iteration),
            continue_experiment: true,
            host: self.params.host.clone(),
            port,
            gpu: self.params.gpu.clone(),
        };
        self.run_log
            .add_message("Iterating", json!({ "Checkpoint": iteration }), Some(iteration))?;
        info!(iteration, port, "evaluating checkpoint");

        self.runner.run(&invocation, &self.cancel)?;
        self.cancel.check()?;
        let raw = BenchmarkResult::load_latest(
            &self.paths.benchmark_results_dir(),
            &invocation.results_prefix(),
        )?;

        self.transition(DriveState::Aggregating);
        let summaries = aggregate(
            &[raw],
            &self.suite.weathers(),
            self.suite.episodes_per_condition(),
            &self.tasks,
        )?;

        self.transition(DriveState::Persisting);
        for row in summaries.rows() {
            self.summary.append(iteration, row)?;
            debug!(iteration, task = %row.task, "summary row appended");
        }
        info!(iteration, tasks = summaries.len(), "checkpoint evaluated");
        Ok(())
    }

    /// Top-level handler: run, record the terminal run-log entry, and map
    /// the outcome to a process exit code.
    pub fn execute(&self) -> i32 {
        match self.run() {
            Ok(DriveOutcome::Finished) => {
                if let Err(e) = self.run_log.add_message("Finished", json!({}), None) {
                    warn!(error = %e, "failed to write run log");
                }
                0
            }
            Ok(DriveOutcome::Idle { .. }) => 0,
            Err(err) => {
                self.transition(DriveState::FatalError);
                record_fatal(&self.run_log, &err)
            }
        }
    }
}

/// Log `err`, write the terminal `Error` run-log entry, and return the exit
/// code for a failed run. Also used for failures before a driver exists.
pub fn record_fatal(run_log: &RunLog, err: &EvalError) -> i32 {
    error!(kind = %err.kind(), "evaluation failed: {:#}", err);
    let payload = json!({
        "Message": err.run_log_message(),
        "Detail": format!("{:#}", err),
    });
    if let Err(e) = run_log.add_message("Error", payload, None) {
        warn!(error = %e, "failed to write run log");
    }
    1
}
