//! Per-task CSV summary logs. One row per evaluated checkpoint; the first
//! column of the reference task's log is the persisted progress of a run.

use crate::aggregate::{TaskSummary, SUMMARY_METRICS};
use crate::atomic_write_bytes;
use anyhow::{anyhow, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SummaryLog {
    base: PathBuf,
}

impl SummaryLog {
    /// `base` is the path prefix; task `t` lives at `{base}_{t}.csv`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn task_path(&self, task: &str) -> PathBuf {
        let mut name = self
            .base
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        name.push(format!("_{}.csv", task));
        self.base.with_file_name(name)
    }

    pub fn header() -> String {
        let mut cols = vec!["step".to_string(), "task_index".to_string()];
        for metric in SUMMARY_METRICS {
            cols.push(format!("{}_mean", metric));
            cols.push(format!("{}_std", metric));
        }
        cols.join(",")
    }

    /// Create (or truncate) the task's log with only the header row.
    pub fn write_header(&self, task: &str) -> Result<()> {
        let mut bytes = Self::header().into_bytes();
        bytes.push(b'\n');
        atomic_write_bytes(&self.task_path(task), &bytes)
    }

    /// Append one checkpoint's row. Writes the header first if the log does
    /// not exist yet.
    pub fn append(&self, iteration: u64, summary: &TaskSummary) -> Result<()> {
        if summary.metrics.len() != SUMMARY_METRICS.len() {
            return Err(anyhow!(
                "summary_row: task '{}' has {} metrics, expected {}",
                summary.task,
                summary.metrics.len(),
                SUMMARY_METRICS.len()
            ));
        }
        let path = self.task_path(&summary.task);
        if !path.exists() || drop_partial_tail(&path)? == 0 {
            self.write_header(&summary.task)?;
        }
        let mut cols = vec![iteration.to_string(), summary.task_index.to_string()];
        for stat in &summary.metrics {
            cols.push(stat.mean.to_string());
            cols.push(stat.std.to_string());
        }
        let mut file = fs::OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{}", cols.join(","))?;
        file.flush()?;
        Ok(())
    }

    /// Iterations recorded in a summary log, in file order. Absent log means
    /// nothing evaluated. Only newline-terminated rows with every column
    /// count; an unterminated last line is an interrupted write.
    pub fn iterations(path: &Path) -> Result<Vec<u64>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow!("failed to read {}: {}", path.display(), e)),
        };
        let data = String::from_utf8_lossy(&bytes);
        let columns = 2 + 2 * SUMMARY_METRICS.len();
        Ok(data
            .split_inclusive('\n')
            .filter_map(|line| line.strip_suffix('\n'))
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| line.split(',').count() == columns)
            .filter_map(|line| line.split(',').next()?.trim().parse::<u64>().ok())
            .collect())
    }

    pub fn latest_iteration(path: &Path) -> Result<Option<u64>> {
        Ok(Self::iterations(path)?.into_iter().max())
    }
}

/// Cut an unterminated last line off the log so the next row starts on a
/// line of its own. Returns the length kept.
fn drop_partial_tail(path: &Path) -> Result<u64> {
    let bytes = fs::read(path)?;
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(bytes.len() as u64);
    }
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1) as u64;
    warn!(
        path = %path.display(),
        dropped = bytes.len() as u64 - keep,
        "discarding unterminated summary row"
    );
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::MetricStat;
    use crate::test_support::temp_root;

    fn row(task: &str, index: usize, value: f64) -> TaskSummary {
        TaskSummary {
            task: task.to_string(),
            task_index: index,
            metrics: vec![MetricStat { mean: value, std: 0.5 }; SUMMARY_METRICS.len()],
        }
    }

    #[test]
    fn header_lists_mean_and_std_per_metric() {
        let header = SummaryLog::header();
        assert!(header.starts_with("step,task_index,episodes_completion_mean,episodes_completion_std,"));
        assert!(header.ends_with("driven_kilometers_mean,driven_kilometers_std"));
        assert_eq!(header.split(',').count(), 18);
    }

    #[test]
    fn task_path_appends_task_suffix() {
        let log = SummaryLog::new("/x/drive_S_T_csv/control_output");
        assert_eq!(
            log.task_path("empty"),
            PathBuf::from("/x/drive_S_T_csv/control_output_empty.csv")
        );
    }

    #[test]
    fn latest_iteration_tracks_appended_rows() {
        let root = temp_root("summary_latest");
        let log = SummaryLog::new(root.join("drive_csv").join("control_output"));
        let path = log.task_path("empty");
        assert_eq!(SummaryLog::latest_iteration(&path).expect("absent"), None);

        log.write_header("empty").expect("header");
        assert_eq!(SummaryLog::latest_iteration(&path).expect("header only"), None);

        log.append(0, &row("empty", 0, 1.0)).expect("row 0");
        log.append(500, &row("empty", 0, 0.25)).expect("row 500");
        assert_eq!(SummaryLog::iterations(&path).expect("iters"), vec![0, 500]);
        assert_eq!(SummaryLog::latest_iteration(&path).expect("latest"), Some(500));

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.lines().nth(2).unwrap_or("").starts_with("500,0,0.25,0.5,"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn truncated_trailing_row_is_ignored() {
        let root = temp_root("summary_partial");
        let log = SummaryLog::new(root.join("control_output"));
        log.append(100, &row("dense", 2, 1.0)).expect("append creates header");
        let path = log.task_path("dense");
        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        write!(file, "200,2,0.1").expect("partial write");
        drop(file);
        assert_eq!(SummaryLog::latest_iteration(&path).expect("latest"), Some(100));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unterminated_full_width_row_is_not_evaluated_and_is_replaced() {
        let root = temp_root("summary_unterminated");
        let log = SummaryLog::new(root.join("control_output"));
        log.append(0, &row("empty", 0, 1.0)).expect("row 0");
        let path = log.task_path("empty");
        let mut cut = vec!["100".to_string(), "0".to_string()];
        cut.extend(std::iter::repeat("0.5".to_string()).take(2 * SUMMARY_METRICS.len()));
        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        write!(file, "{}", cut.join(",")).expect("unterminated row");
        drop(file);
        assert_eq!(SummaryLog::iterations(&path).expect("iters"), vec![0]);

        log.append(100, &row("empty", 0, 0.25)).expect("row 100");
        log.append(200, &row("empty", 0, 0.25)).expect("row 200");
        assert_eq!(SummaryLog::iterations(&path).expect("iters"), vec![0, 100, 200]);
        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text.lines().count(), 4);
        assert!(text.ends_with('\n'));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unterminated_header_is_rewritten_before_first_row() {
        let root = temp_root("summary_cut_header");
        let log = SummaryLog::new(root.join("control_output"));
        let path = log.task_path("empty");
        fs::write(&path, "step,task_in").expect("cut header");
        log.append(0, &row("empty", 0, 1.0)).expect("row 0");
        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text.lines().next(), Some(SummaryLog::header().as_str()));
        assert_eq!(SummaryLog::iterations(&path).expect("iters"), vec![0]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn append_rejects_short_rows() {
        let root = temp_root("summary_short");
        let log = SummaryLog::new(root.join("control_output"));
        let mut short = row("empty", 0, 1.0);
        short.metrics.pop();
        assert!(log.append(0, &short).is_err());
        assert!(!log.task_path("empty").exists());
        let _ = fs::remove_dir_all(root);
    }
}
