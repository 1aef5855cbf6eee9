//! Read-only classification of a process's progress from its run log.

use crate::config::{default_number_of_iterations, RunPaths};
use crate::run_log::RunLog;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    DoesNotExist,
    NotStarted,
    Loading,
    Iterating,
    Error,
    Finished,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::DoesNotExist => "Does Not Exist",
            RunStatus::NotStarted => "Not Started",
            RunStatus::Loading => "Loading",
            RunStatus::Iterating => "Iterating",
            RunStatus::Error => "Error",
            RunStatus::Finished => "Finished",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub status: RunStatus,
    /// Payload of the entry that decided the status; `null` when there is
    /// no such entry.
    pub summary: Value,
}

impl StatusReport {
    fn bare(status: RunStatus) -> Self {
        Self {
            status,
            summary: Value::Null,
        }
    }
}

const PROGRESS_TAGS: [&str; 4] = ["Iterating", "Model", "Reading", "Loss"];

/// The one config field status classification needs. The rest of the
/// experiment config may be incomplete while a run is being set up.
#[derive(Debug, Deserialize)]
struct ProgressConfig {
    #[serde(default = "default_number_of_iterations")]
    number_of_iterations: u64,
}

impl ProgressConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
        if raw.trim().is_empty() {
            return Ok(Self {
                number_of_iterations: default_number_of_iterations(),
            });
        }
        serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config {}: {}", path.display(), e))
    }
}

pub fn get_status(
    root: &Path,
    batch: &str,
    experiment: &str,
    process_name: &str,
) -> Result<StatusReport> {
    let config_path = RunPaths::config_path(root, batch, experiment);
    if !config_path.is_file() {
        return Ok(StatusReport::bare(RunStatus::DoesNotExist));
    }
    let log_path = RunPaths::new(root, batch, experiment, process_name).run_log_path();
    if !log_path.is_file() {
        return Ok(StatusReport::bare(RunStatus::NotStarted));
    }
    let entries = RunLog::read_entries(&log_path)?;
    let Some(last) = entries.last() else {
        return Ok(StatusReport::bare(RunStatus::NotStarted));
    };

    let status = match last.tag.as_str() {
        "Loading" => RunStatus::Loading,
        "Error" => RunStatus::Error,
        "Finished" => RunStatus::Finished,
        tag if PROGRESS_TAGS.contains(&tag) => {
            let config = ProgressConfig::load(&config_path)?;
            match last.payload.get("Iteration").and_then(Value::as_u64) {
                Some(it) if it >= config.number_of_iterations => RunStatus::Finished,
                _ => RunStatus::Iterating,
            }
        }
        other => {
            return Err(anyhow!(
                "unrecognized_log_entry: tag '{}' in {}",
                other,
                log_path.display()
            ))
        }
    };
    Ok(StatusReport {
        status,
        summary: last.payload.clone(),
    })
}
