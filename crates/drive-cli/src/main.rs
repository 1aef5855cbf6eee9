use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use drive_runner::run_log::RunLog;
use drive_runner::summary::SummaryLog;
use drive_runner::{
    get_status, record_fatal, CancelToken, CarlaSupervisor, CheckpointScheduler,
    CommandBenchmarkRunner, DriveCondition, DriveParams, EvalError, EvaluationDriver,
    ExperimentConfig, PollPolicy, RunPaths, SimulatorPolicy, SuiteId,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drive", version = "0.3.0", about = "Checkpoint driving evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every scheduled checkpoint of an experiment on one drive condition.
    Run {
        #[arg(long, default_value = "0")]
        gpu: String,
        #[arg(long)]
        batch: String,
        #[arg(long)]
        alias: String,
        /// `<Suite>_<Town>`, e.g. `NocrashTraining_Town01`.
        #[arg(long)]
        drive_conditions: String,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        no_screen: bool,
        #[arg(long)]
        docker: bool,
        #[arg(long)]
        record_collisions: bool,
        #[arg(long)]
        suppress_output: bool,
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
        #[arg(long)]
        idle_timeout_secs: Option<u64>,
        #[arg(long)]
        reuse_simulator: bool,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    Status {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        process_name: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        alias: String,
        #[arg(long)]
        drive_conditions: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            gpu,
            batch,
            alias,
            drive_conditions,
            host,
            no_screen,
            docker,
            record_collisions,
            suppress_output,
            poll_interval_ms,
            idle_timeout_secs,
            reuse_simulator,
            root,
        } => {
            let root = resolve_root(root)?;
            let condition = DriveCondition::parse(&drive_conditions)?;
            let paths = RunPaths::new(&root, &batch, &alias, &condition.process_name());
            let pid = std::process::id();
            let run_log = RunLog::new(paths.run_log_path());
            let prepared = (|| -> Result<EvaluationDriver<CarlaSupervisor, CommandBenchmarkRunner>> {
                if suppress_output {
                    let log_path = paths
                        .output_logs_dir()
                        .join(format!("{}_{}.out", paths.process_name, pid));
                    init_logging(Some(&log_path))?;
                } else {
                    init_logging(None)?;
                }

                let config =
                    ExperimentConfig::load(&RunPaths::config_path(&root, &batch, &alias))?;
                let params = DriveParams {
                    gpu,
                    host,
                    no_screen,
                    docker,
                    record_collisions,
                    simulator_policy: if reuse_simulator {
                        SimulatorPolicy::ReuseAcrossCheckpoints
                    } else {
                        SimulatorPolicy::RelaunchPerCheckpoint
                    },
                };
                let supervisor = CarlaSupervisor::new(
                    &config.simulator,
                    &paths,
                    RunLog::new(paths.run_log_path()),
                );
                let mut runner = CommandBenchmarkRunner::new(
                    config.benchmark.command.clone(),
                    config.benchmark.transport_exit_code,
                );
                if suppress_output {
                    runner = runner.with_output_log(
                        paths
                            .output_logs_dir()
                            .join(format!("benchmark_{}_{}.out", paths.process_name, pid)),
                    );
                }
                let poll = PollPolicy {
                    interval: Duration::from_millis(poll_interval_ms),
                    idle_timeout: idle_timeout_secs.map(Duration::from_secs),
                };
                Ok(
                    EvaluationDriver::new(config, params, paths, condition, supervisor, runner)?
                        .with_poll_policy(poll)
                        .with_cancel_token(CancelToken::with_interrupts()?),
                )
            })();
            // Startup failures end the run the same way a failed evaluation does.
            let code = match prepared {
                Ok(driver) => driver.execute(),
                Err(err) => record_fatal(&run_log, &EvalError::from(err)),
            };
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status {
            batch,
            experiment,
            process_name,
            root,
            json,
        } => {
            init_logging_simple();
            let root = resolve_root(root)?;
            let report = get_status(&root, &batch, &experiment, &process_name)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "process_name": process_name,
                    "status": report.status,
                    "label": report.status.to_string(),
                    "summary": report.summary
                })));
            }
            println!("{}: {}", process_name, report.status);
            if !report.summary.is_null() {
                println!("summary: {}", report.summary);
            }
        }
        Commands::Describe {
            batch,
            alias,
            drive_conditions,
            root,
            json,
        } => {
            init_logging_simple();
            let root = resolve_root(root)?;
            let description = describe(&root, &batch, &alias, &drive_conditions)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "description": description
                })));
            }
            print_description(&description);
        }
    }
    Ok(None)
}

fn describe(root: &Path, batch: &str, alias: &str, drive_conditions: &str) -> Result<Value> {
    let condition = DriveCondition::parse(drive_conditions)?;
    let config = ExperimentConfig::load(&RunPaths::config_path(root, batch, alias))?;
    let suite = SuiteId::parse(&condition.suite)?.build();
    let tasks = suite.task_list();
    let reference = tasks
        .reference()
        .ok_or_else(|| anyhow!("empty_suite: {} defines no tasks", suite.id()))?;
    let paths = RunPaths::new(root, batch, alias, &condition.process_name());
    let summary = SummaryLog::new(paths.summary_base(config.control_filename()));
    let scheduler = CheckpointScheduler::for_summary(
        config.test_schedule.clone(),
        &summary,
        reference,
        &paths.checkpoints_dir(),
        &config.checkpoint_extension,
    );
    let next = scheduler.next_checkpoint()?;
    Ok(json!({
        "process_name": paths.process_name,
        "suite": suite.id().name(),
        "town": condition.town,
        "tasks": tasks.names(),
        "weathers": suite.weathers(),
        "episodes_per_condition": suite.episodes_per_condition(),
        "test_schedule": config.test_schedule.entries(),
        "latest_evaluated": scheduler.latest_evaluated()?,
        "next_checkpoint": next,
        "next_checkpoint_path": next.map(|n| scheduler.checkpoint_path(n).display().to_string()),
        "next_checkpoint_ready": scheduler.is_next_checkpoint_ready()?,
        "summary_log": scheduler.reference_log().display().to_string(),
        "run_log": paths.run_log_path().display().to_string(),
    }))
}

fn print_description(description: &Value) {
    if let Some(map) = description.as_object() {
        for (key, value) in map {
            match value {
                Value::String(s) => println!("{}: {}", key, s),
                Value::Null => println!("{}: none", key),
                other => println!("{}: {}", key, other),
            }
        }
    }
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => Ok(drive_runner::find_project_root(&std::env::current_dir()?)),
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,drive_runner=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow!("failed to initialise logging: {}", e))
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow!("failed to initialise logging: {}", e)),
    }
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .try_init();
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Status { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Run { .. } => false,
    }
}
