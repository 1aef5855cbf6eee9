//! Boundary to the external benchmark: run one suite against one checkpoint
//! on a running simulator and read back the raw per-episode metrics it
//! leaves under `_benchmarks_results/`.

use crate::cancel::CancelToken;
use crate::ensure_dir;
use crate::error::EvalError;
use crate::suites::SuiteId;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// A checkpoint file that was present and non-empty when loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub iteration: u64,
    pub path: PathBuf,
}

impl Checkpoint {
    pub fn load(iteration: u64, path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)
            .map_err(|e| anyhow!("checkpoint_unreadable: {}: {}", path.display(), e))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(anyhow!(
                "checkpoint_unreadable: {} is not a non-empty file",
                path.display()
            ));
        }
        Ok(Self {
            iteration,
            path: path.to_path_buf(),
        })
    }
}

/// The model under evaluation for a single checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalAgent {
    pub checkpoint: Checkpoint,
    pub town: String,
    pub record_collisions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkInvocation {
    pub agent: EvalAgent,
    pub suite: SuiteId,
    pub run_name: String,
    pub continue_experiment: bool,
    pub host: String,
    pub port: u16,
    pub gpu: String,
}

impl BenchmarkInvocation {
    /// Prefix of the directory the benchmark writes its results into.
    pub fn results_prefix(&self) -> String {
        format!("{}_{}_{}", self.run_name, self.suite.name(), self.agent.town)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--checkpoint".to_string(),
            self.agent.checkpoint.path.to_string_lossy().to_string(),
            "--suite".to_string(),
            self.suite.name().to_string(),
            "--town".to_string(),
            self.agent.town.clone(),
            "--run-name".to_string(),
            self.run_name.clone(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if self.continue_experiment {
            args.push("--continue".to_string());
        }
        if self.agent.record_collisions {
            args.push("--record-collisions".to_string());
        }
        args
    }
}

pub trait BenchmarkRunner {
    /// Drive every episode of the suite. Blocks until the benchmark is done,
    /// fails, or `cancel` trips.
    fn run(&self, invocation: &BenchmarkInvocation, cancel: &CancelToken) -> Result<(), EvalError>;
}

/// Runs the benchmark as a child process and classifies its exit status.
pub struct CommandBenchmarkRunner {
    command: Vec<String>,
    transport_exit_code: i32,
    output_log: Option<PathBuf>,
    poll_interval: Duration,
}

impl CommandBenchmarkRunner {
    pub fn new(command: Vec<String>, transport_exit_code: i32) -> Self {
        Self {
            command,
            transport_exit_code,
            output_log: None,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Send the benchmark's stdout and stderr to `path` instead of the
    /// terminal.
    pub fn with_output_log(mut self, path: PathBuf) -> Self {
        self.output_log = Some(path);
        self
    }

    fn classify_exit(&self, status: ExitStatus) -> Result<(), EvalError> {
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) if code == self.transport_exit_code => Err(EvalError::Transport(format!(
                "benchmark exited with {} after losing the simulator connection",
                code
            ))),
            Some(code) => Err(EvalError::Unclassified(anyhow!(
                "benchmark_failed: exited with status {}",
                code
            ))),
            None => Err(EvalError::Unclassified(anyhow!(
                "benchmark_failed: terminated by signal ({})",
                status
            ))),
        }
    }
}

impl BenchmarkRunner for CommandBenchmarkRunner {
    fn run(&self, invocation: &BenchmarkInvocation, cancel: &CancelToken) -> Result<(), EvalError> {
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("benchmark command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .args(invocation.args())
            .env("CUDA_VISIBLE_DEVICES", &invocation.gpu)
            .stdin(Stdio::null());
        if let Some(path) = self.output_log.as_ref() {
            if let Some(parent) = path.parent() {
                ensure_dir(parent)?;
            }
            let out = fs::OpenOptions::new().create(true).append(true).open(path)?;
            let err = out.try_clone()?;
            cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }

        info!(
            checkpoint = invocation.agent.checkpoint.iteration,
            suite = %invocation.suite,
            port = invocation.port,
            "starting benchmark"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn benchmark {}: {}", program, e))?;

        loop {
            if cancel.is_cancelled() {
                if let Err(e) = child.kill() {
                    warn!(pid = child.id(), error = %e, "failed to kill benchmark");
                }
                let _ = child.wait();
                return Err(EvalError::Cancelled);
            }
            if let Some(status) = child.try_wait()? {
                debug!(status = %status, "benchmark exited");
                return self.classify_exit(status);
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Raw benchmark output: `{metric: {weather: [[task0 episodes], [task1 ...]]}}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BenchmarkResult {
    pub metrics: BTreeMap<String, BTreeMap<String, Vec<Vec<f64>>>>,
}

impl BenchmarkResult {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("missing_benchmark_results: {}: {}", path.display(), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid_benchmark_results: {}: {}", path.display(), e))
    }

    /// `metrics.json` of the newest results directory matching `prefix`.
    pub fn load_latest(results_dir: &Path, prefix: &str) -> Result<Self> {
        let dir = latest_results_dir(results_dir, prefix)?;
        Self::load(&dir.join("metrics.json"))
    }
}

/// Newest directory under `results_dir` whose name starts with `prefix`.
/// Re-running a checkpoint leaves older directories behind; only the last
/// one counts.
pub fn latest_results_dir(results_dir: &Path, prefix: &str) -> Result<PathBuf> {
    let entries = fs::read_dir(results_dir).map_err(|e| {
        anyhow!(
            "missing_benchmark_results: {}: {}",
            results_dir.display(),
            e
        )
    })?;
    let mut best: Option<(SystemTime, String, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) || !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let newer = match best.as_ref() {
            None => true,
            Some((t, n, _)) => (modified, &name) > (*t, n),
        };
        if newer {
            best = Some((modified, name, entry.path()));
        }
    }
    best.map(|(_, _, path)| path).ok_or_else(|| {
        anyhow!(
            "missing_benchmark_results: no directory under {} starts with '{}'",
            results_dir.display(),
            prefix
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::temp_root;
    use std::time::Instant;

    fn invocation(root: &Path) -> BenchmarkInvocation {
        let ckpt = root.join("100.pth");
        fs::write(&ckpt, b"weights").expect("checkpoint");
        BenchmarkInvocation {
            agent: EvalAgent {
                checkpoint: Checkpoint::load(100, &ckpt).expect("load"),
                town: "Town01".to_string(),
                record_collisions: true,
            },
            suite: SuiteId::NocrashTraining,
            run_name: "batch_exp_100_drive_control_output".to_string(),
            continue_experiment: false,
            host: "127.0.0.1".to_string(),
            port: 2000,
            gpu: "3".to_string(),
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ]
    }

    #[test]
    fn checkpoint_load_rejects_missing_and_empty_files() {
        let root = temp_root("ckpt_load");
        assert!(Checkpoint::load(5, &root.join("5.pth")).is_err());
        fs::write(root.join("5.pth"), b"").expect("empty");
        assert!(Checkpoint::load(5, &root.join("5.pth")).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn invocation_args_and_results_prefix() {
        let root = temp_root("bench_args");
        let inv = invocation(&root);
        let args = inv.args();
        assert_eq!(args[0], "--checkpoint");
        assert!(args.contains(&"NocrashTraining".to_string()));
        assert!(args.contains(&"--record-collisions".to_string()));
        assert!(!args.contains(&"--continue".to_string()));
        assert_eq!(
            inv.results_prefix(),
            "batch_exp_100_drive_control_output_NocrashTraining_Town01"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_is_classified() {
        let root = temp_root("bench_exit");
        let inv = invocation(&root);
        let cancel = CancelToken::new();

        CommandBenchmarkRunner::new(sh("test \"$CUDA_VISIBLE_DEVICES\" = 3"), 75)
            .run(&inv, &cancel)
            .expect("gpu pinned through env");

        let err = CommandBenchmarkRunner::new(sh("exit 75"), 75)
            .run(&inv, &cancel)
            .expect_err("transport");
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err = CommandBenchmarkRunner::new(sh("exit 3"), 75)
            .run(&inv, &cancel)
            .expect_err("other failure");
        assert_eq!(err.kind(), ErrorKind::Unclassified);

        let err = CommandBenchmarkRunner::new(Vec::new(), 75)
            .run(&inv, &cancel)
            .expect_err("empty command");
        assert_eq!(err.kind(), ErrorKind::Unclassified);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn cancel_kills_running_benchmark() {
        let root = temp_root("bench_cancel");
        let inv = invocation(&root);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let trip = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });
        let started = Instant::now();
        let err = CommandBenchmarkRunner::new(sh("sleep 30"), 75)
            .run(&inv, &cancel)
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        trip.join().expect("join");
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn output_log_captures_benchmark_output() {
        let root = temp_root("bench_output");
        let inv = invocation(&root);
        let log = root.join("_output_logs").join("bench.out");
        CommandBenchmarkRunner::new(sh("echo driving; echo oops >&2"), 75)
            .with_output_log(log.clone())
            .run(&inv, &CancelToken::new())
            .expect("run");
        let captured = fs::read_to_string(&log).expect("log");
        assert!(captured.contains("driving"));
        assert!(captured.contains("oops"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn newest_matching_results_dir_wins() {
        let root = temp_root("bench_latest");
        let results = root.join("_benchmarks_results");
        let prefix = "b_e_100_drive_control_output_TestSuite_Town01";
        ensure_dir(&results.join(format!("{}_older", prefix))).expect("older");
        thread::sleep(Duration::from_millis(30));
        ensure_dir(&results.join(format!("{}_newer", prefix))).expect("newer");
        ensure_dir(&results.join("b_e_200_drive_control_output_TestSuite_Town01")).expect("other");

        let latest = latest_results_dir(&results, prefix).expect("latest");
        assert!(latest.ends_with(format!("{}_newer", prefix)));

        fs::write(
            latest.join("metrics.json"),
            r#"{"collision_other": {"1": [[0, 1], [2.5, 0]]}}"#,
        )
        .expect("metrics");
        let result = BenchmarkResult::load_latest(&results, prefix).expect("load");
        assert_eq!(result.metrics["collision_other"]["1"][1], vec![2.5, 0.0]);

        let err = latest_results_dir(&results, "nothing_here").expect_err("no match");
        assert!(err.to_string().contains("missing_benchmark_results"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
