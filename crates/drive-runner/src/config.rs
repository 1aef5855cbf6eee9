//! Experiment configuration, built once at startup and passed by reference
//! into every component.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Ordered checkpoint iterations to evaluate. Never decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSchedule")]
pub struct TestSchedule(Vec<u64>);

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawSchedule {
    List(Vec<u64>),
    Range { start: u64, end: u64, step: u64 },
}

impl TryFrom<RawSchedule> for TestSchedule {
    type Error = anyhow::Error;

    fn try_from(raw: RawSchedule) -> Result<Self> {
        match raw {
            RawSchedule::List(entries) => TestSchedule::new(entries),
            RawSchedule::Range { start, end, step } => TestSchedule::from_range(start, end, step),
        }
    }
}

impl TestSchedule {
    pub fn new(entries: Vec<u64>) -> Result<Self> {
        if let Some(pos) = entries.windows(2).position(|w| w[1] < w[0]) {
            return Err(anyhow!(
                "invalid_test_schedule: entry {} ({}) is below its predecessor ({})",
                pos + 1,
                entries[pos + 1],
                entries[pos]
            ));
        }
        Ok(Self(entries))
    }

    /// `start, start+step, ...` up to and including `end` when reachable.
    pub fn from_range(start: u64, end: u64, step: u64) -> Result<Self> {
        if step == 0 {
            return Err(anyhow!("invalid_test_schedule: step must be positive"));
        }
        if end < start {
            return Err(anyhow!(
                "invalid_test_schedule: end {} is below start {}",
                end,
                start
            ));
        }
        Ok(Self((start..=end).step_by(step as usize).collect()))
    }

    pub fn entries(&self) -> &[u64] {
        &self.0
    }

    pub fn last(&self) -> Option<u64> {
        self.0.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    /// Simulator install root; `$CARLA_PATH` when unset.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            root: None,
            docker_image: default_docker_image(),
            fps: default_fps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_benchmark_command")]
    pub command: Vec<String>,
    /// Exit status the benchmark process uses to report a lost simulator
    /// connection.
    #[serde(default = "default_transport_exit_code")]
    pub transport_exit_code: i32,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            command: default_benchmark_command(),
            transport_exit_code: default_transport_exit_code(),
        }
    }
}

/// Typed view of `configs/<batch>/<alias>.yaml`. Keys used by other
/// processes of the experiment (training, validation) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub test_schedule: TestSchedule,
    #[serde(default)]
    pub use_oracle: bool,
    #[serde(default = "default_number_of_iterations")]
    pub number_of_iterations: u64,
    #[serde(default = "default_checkpoint_extension")]
    pub checkpoint_extension: String,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
        Self::from_yaml(&raw).map_err(|e| anyhow!("invalid config {}: {:#}", path.display(), e))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Base name of the per-task summary logs.
    pub fn control_filename(&self) -> &'static str {
        if self.use_oracle {
            "control_output_auto"
        } else {
            "control_output"
        }
    }
}

fn default_docker_image() -> String {
    "carlagear".to_string()
}

fn default_fps() -> u32 {
    10
}

fn default_benchmark_command() -> Vec<String> {
    vec![
        "python".to_string(),
        "-m".to_string(),
        "drive.run_benchmark".to_string(),
    ]
}

fn default_transport_exit_code() -> i32 {
    75
}

pub(crate) fn default_number_of_iterations() -> u64 {
    200_000
}

fn default_checkpoint_extension() -> String {
    "pth".to_string()
}

/// `<SuiteName>_<TownName>`, e.g. `NocrashTraining_Town01`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveCondition {
    pub suite: String,
    pub town: String,
}

impl DriveCondition {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('_').collect();
        match parts.as_slice() {
            [suite, town] if !suite.is_empty() && !town.is_empty() => Ok(Self {
                suite: suite.to_string(),
                town: town.to_string(),
            }),
            _ => Err(anyhow!(
                "invalid_drive_condition: expected <Suite>_<Town>, got '{}'",
                raw
            )),
        }
    }

    pub fn process_name(&self) -> String {
        format!("drive_{}_{}", self.suite, self.town)
    }
}

impl std::fmt::Display for DriveCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.suite, self.town)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimulatorPolicy {
    /// Fresh simulator for every checkpoint.
    #[default]
    RelaunchPerCheckpoint,
    /// Keep one simulator alive across checkpoints; relaunch only after the
    /// run restarts.
    ReuseAcrossCheckpoints,
}

/// Per-invocation parameters supplied on the command line.
#[derive(Debug, Clone)]
pub struct DriveParams {
    pub gpu: String,
    pub host: String,
    pub no_screen: bool,
    pub docker: bool,
    pub record_collisions: bool,
    pub simulator_policy: SimulatorPolicy,
}

impl Default for DriveParams {
    fn default() -> Self {
        Self {
            gpu: "0".to_string(),
            host: "127.0.0.1".to_string(),
            no_screen: false,
            docker: false,
            record_collisions: false,
            simulator_policy: SimulatorPolicy::default(),
        }
    }
}

/// Filesystem layout of one experiment's drive process.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub batch: String,
    pub alias: String,
    pub process_name: String,
}

impl RunPaths {
    pub fn new(root: &Path, batch: &str, alias: &str, process_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            batch: batch.to_string(),
            alias: alias.to_string(),
            process_name: process_name.to_string(),
        }
    }

    pub fn config_path(root: &Path, batch: &str, alias: &str) -> PathBuf {
        root.join("configs").join(batch).join(format!("{}.yaml", alias))
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.root.join("_logs").join(&self.batch).join(&self.alias)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.experiment_dir().join("checkpoints")
    }

    pub fn checkpoint_path(&self, iteration: u64, extension: &str) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("{}.{}", iteration, extension))
    }

    /// Prefix of the per-task summary logs; each task appends `_<task>.csv`.
    pub fn summary_base(&self, control_filename: &str) -> PathBuf {
        self.experiment_dir()
            .join(format!("{}_csv", self.process_name))
            .join(control_filename)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.experiment_dir().join(&self.process_name)
    }

    pub fn output_logs_dir(&self) -> PathBuf {
        self.root.join("_output_logs")
    }

    pub fn benchmark_results_dir(&self) -> PathBuf {
        self.root.join("_benchmarks_results")
    }
}
