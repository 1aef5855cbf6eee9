//! Which checkpoint to evaluate next, derived from the test schedule and the
//! persisted summary log. Nothing here keeps state between calls: progress
//! is re-read from disk each time, so a restarted driver resumes where the
//! previous one stopped.

use crate::config::TestSchedule;
use crate::summary::SummaryLog;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// True once the newest evaluated checkpoint has reached the end of the
/// schedule. An empty schedule is always complete.
pub fn maximum_checkpoint_reached(latest: Option<u64>, schedule: &TestSchedule) -> bool {
    match (latest, schedule.last()) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(latest), Some(last)) => latest >= last,
    }
}

/// Smallest scheduled entry strictly after `latest`; the first entry when
/// nothing has been evaluated.
pub fn next_in_schedule(schedule: &TestSchedule, latest: Option<u64>) -> Option<u64> {
    schedule
        .entries()
        .iter()
        .copied()
        .find(|&entry| latest.map_or(true, |l| entry > l))
}

#[derive(Debug, Clone)]
pub struct CheckpointScheduler {
    schedule: TestSchedule,
    reference_log: PathBuf,
    checkpoints_dir: PathBuf,
    extension: String,
}

impl CheckpointScheduler {
    pub fn new(
        schedule: TestSchedule,
        reference_log: PathBuf,
        checkpoints_dir: PathBuf,
        extension: &str,
    ) -> Self {
        Self {
            schedule,
            reference_log,
            checkpoints_dir,
            extension: extension.to_string(),
        }
    }

    /// Scheduler reading progress from `summary`'s log for `reference_task`.
    pub fn for_summary(
        schedule: TestSchedule,
        summary: &SummaryLog,
        reference_task: &str,
        checkpoints_dir: &Path,
        extension: &str,
    ) -> Self {
        Self::new(
            schedule,
            summary.task_path(reference_task),
            checkpoints_dir.to_path_buf(),
            extension,
        )
    }

    pub fn schedule(&self) -> &TestSchedule {
        &self.schedule
    }

    pub fn reference_log(&self) -> &Path {
        &self.reference_log
    }

    pub fn latest_evaluated(&self) -> Result<Option<u64>> {
        SummaryLog::latest_iteration(&self.reference_log)
    }

    pub fn maximum_reached(&self) -> Result<bool> {
        Ok(maximum_checkpoint_reached(
            self.latest_evaluated()?,
            &self.schedule,
        ))
    }

    pub fn next_checkpoint(&self) -> Result<Option<u64>> {
        Ok(next_in_schedule(&self.schedule, self.latest_evaluated()?))
    }

    pub fn checkpoint_path(&self, iteration: u64) -> PathBuf {
        self.checkpoints_dir
            .join(format!("{}.{}", iteration, self.extension))
    }

    /// Whether the next scheduled checkpoint has been published. Only a
    /// non-empty regular file counts.
    pub fn is_next_checkpoint_ready(&self) -> Result<bool> {
        let Some(next) = self.next_checkpoint()? else {
            return Ok(false);
        };
        Ok(fs::metadata(self.checkpoint_path(next))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false))
    }
}
