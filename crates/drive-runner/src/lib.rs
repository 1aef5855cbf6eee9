pub mod aggregate;
pub mod benchmark;
pub mod cancel;
pub mod config;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod ports;
pub mod run_log;
pub mod schedule;
pub mod summary;
pub mod suites;
pub mod supervisor;

pub use aggregate::{aggregate, SummaryByTask, TaskSummary};
pub use benchmark::{BenchmarkInvocation, BenchmarkResult, BenchmarkRunner, CommandBenchmarkRunner};
pub use cancel::CancelToken;
pub use config::{DriveCondition, DriveParams, ExperimentConfig, RunPaths, SimulatorPolicy, TestSchedule};
pub use driver::{record_fatal, DriveOutcome, DriveState, EvaluationDriver, PollPolicy};
pub use error::{ErrorKind, EvalError};
pub use monitor::{get_status, RunStatus, StatusReport};
pub use schedule::{maximum_checkpoint_reached, next_in_schedule, CheckpointScheduler};
pub use suites::{BenchmarkSuite, SuiteId, TaskList};
pub use supervisor::{CarlaSupervisor, LaunchRequest, ProcessHandle, SimulatorSupervisor};

use anyhow::Result;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Walk up from `start` to the first directory holding a `configs/` folder.
/// Falls back to `start` itself.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut cur = Some(start);
    while let Some(p) = cur {
        if p.join("configs").is_dir() {
            return p.to_path_buf();
        }
        cur = p.parent();
    }
    start.to_path_buf()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "drive_eval_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::temp_root;

    #[test]
    fn atomic_write_replaces_existing_contents() {
        let root = temp_root("atomic");
        let path = root.join("nested").join("file.txt");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        let leftovers = fs::read_dir(path.parent().unwrap())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0, "temp files must be renamed away");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn find_project_root_walks_up_to_configs_dir() {
        let root = temp_root("project_root");
        ensure_dir(&root.join("configs").join("batch")).expect("configs");
        let deep = root.join("_logs").join("batch").join("alias");
        ensure_dir(&deep).expect("deep");
        assert_eq!(find_project_root(&deep), root);
        assert_eq!(find_project_root(&root), root);
        let _ = fs::remove_dir_all(root);
    }
}
