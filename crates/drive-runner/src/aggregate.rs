//! Reduce raw per-episode benchmark metrics to one row of mean/std values
//! per task.

use crate::benchmark::BenchmarkResult;
use crate::suites::{TaskList, WeatherId};
use anyhow::{anyhow, Result};

/// Metrics written to every summary row, in column order.
pub const SUMMARY_METRICS: [&str; 8] = [
    "episodes_completion",
    "episodes_fully_completed",
    "intersection_offroad",
    "intersection_otherlane",
    "collision_pedestrians",
    "collision_vehicles",
    "collision_other",
    "driven_kilometers",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStat {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub task: String,
    pub task_index: usize,
    /// One entry per [`SUMMARY_METRICS`] name, same order.
    pub metrics: Vec<MetricStat>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SummaryByTask {
    rows: Vec<TaskSummary>,
}

impl SummaryByTask {
    pub fn rows(&self) -> &[TaskSummary] {
        &self.rows
    }

    pub fn get(&self, task: &str) -> Option<&TaskSummary> {
        self.rows.iter().find(|r| r.task == task)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Pool each task's episode values over every result and selected weather,
/// then take the mean and population standard deviation per metric.
///
/// Shape problems (missing metric or weather, wrong task or episode count)
/// are errors rather than silently shorter averages.
pub fn aggregate(
    raw: &[BenchmarkResult],
    weathers: &[WeatherId],
    episode_count: usize,
    tasks: &TaskList,
) -> Result<SummaryByTask> {
    if raw.is_empty() {
        return Err(anyhow!("aggregate_shape: no benchmark results to aggregate"));
    }
    if weathers.is_empty() {
        return Err(anyhow!("aggregate_shape: no weathers selected"));
    }
    let mut rows = Vec::with_capacity(tasks.len());
    for (task_index, task) in tasks.iter() {
        let mut metrics = Vec::with_capacity(SUMMARY_METRICS.len());
        for metric in SUMMARY_METRICS {
            let values = pooled_values(raw, metric, weathers, episode_count, tasks.len(), task_index)?;
            metrics.push(mean_std(&values));
        }
        rows.push(TaskSummary {
            task: task.to_string(),
            task_index,
            metrics,
        });
    }
    Ok(SummaryByTask { rows })
}

fn pooled_values(
    raw: &[BenchmarkResult],
    metric: &str,
    weathers: &[WeatherId],
    episode_count: usize,
    task_count: usize,
    task_index: usize,
) -> Result<Vec<f64>> {
    let mut values = Vec::with_capacity(raw.len() * weathers.len() * episode_count);
    for result in raw {
        let by_weather = result
            .metrics
            .get(metric)
            .ok_or_else(|| anyhow!("aggregate_shape: metric '{}' missing", metric))?;
        for weather in weathers {
            let per_task = by_weather.get(&weather.to_string()).ok_or_else(|| {
                anyhow!(
                    "aggregate_shape: metric '{}' has no weather {}",
                    metric,
                    weather
                )
            })?;
            if per_task.len() != task_count {
                return Err(anyhow!(
                    "aggregate_shape: metric '{}' weather {} has {} tasks, expected {}",
                    metric,
                    weather,
                    per_task.len(),
                    task_count
                ));
            }
            let episodes = &per_task[task_index];
            if episodes.len() != episode_count {
                return Err(anyhow!(
                    "aggregate_shape: metric '{}' weather {} task {} has {} episodes, expected {}",
                    metric,
                    weather,
                    task_index,
                    episodes.len(),
                    episode_count
                ));
            }
            values.extend_from_slice(episodes);
        }
    }
    Ok(values)
}

fn mean_std(values: &[f64]) -> MetricStat {
    if values.is_empty() {
        return MetricStat { mean: 0.0, std: 0.0 };
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    MetricStat {
        mean,
        std: var.sqrt(),
    }
}
