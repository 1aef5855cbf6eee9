//! Simulator process supervision: launch one simulator (native binary or
//! container) on a fresh port and tear it down again.

use crate::config::{RunPaths, SimulatorConfig};
use crate::ensure_dir;
use crate::error::EvalError;
use crate::ports::allocate_port;
use crate::run_log::RunLog;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub gpu: String,
    pub town: String,
    pub no_screen: bool,
    pub docker: bool,
}

/// One live simulator instance. Consumed by [`SimulatorSupervisor::stop`].
#[derive(Debug)]
pub struct ProcessHandle {
    port: u16,
    child: Option<Child>,
    container_id: Option<String>,
    stdout_log: Option<PathBuf>,
    stderr_log: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn local(child: Child, port: u16, stdout_log: PathBuf, stderr_log: PathBuf) -> Self {
        Self {
            port,
            child: Some(child),
            container_id: None,
            stdout_log: Some(stdout_log),
            stderr_log: Some(stderr_log),
        }
    }

    pub fn container(container_id: String, port: u16) -> Self {
        Self {
            port,
            child: None,
            container_id: Some(container_id),
            stdout_log: None,
            stderr_log: None,
        }
    }

    /// Handle for a simulator this process does not own (already running
    /// elsewhere); stopping it is a no-op.
    pub fn detached(port: u16) -> Self {
        Self {
            port,
            child: None,
            container_id: None,
            stdout_log: None,
            stderr_log: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn stdout_log(&self) -> Option<&PathBuf> {
        self.stdout_log.as_ref()
    }

    pub fn stderr_log(&self) -> Option<&PathBuf> {
        self.stderr_log.as_ref()
    }
}

pub trait SimulatorSupervisor {
    /// Launch a simulator and return as soon as the spawn succeeded. Does not
    /// wait for the simulator to accept connections.
    fn start(&self, request: &LaunchRequest) -> Result<ProcessHandle, EvalError>;

    /// Terminate the instance. Never fails: teardown usually runs on a path
    /// that is already failing, so problems are logged and swallowed.
    fn stop(&self, handle: ProcessHandle);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

pub struct CarlaSupervisor {
    simulator: SimulatorConfig,
    process_name: String,
    output_logs_dir: PathBuf,
    run_log: RunLog,
}

impl CarlaSupervisor {
    pub fn new(simulator: &SimulatorConfig, paths: &RunPaths, run_log: RunLog) -> Self {
        Self {
            simulator: simulator.clone(),
            process_name: paths.process_name.clone(),
            output_logs_dir: paths.output_logs_dir(),
            run_log,
        }
    }

    fn simulator_root(&self) -> Result<PathBuf, EvalError> {
        if let Some(root) = self.simulator.root.as_ref() {
            return Ok(root.clone());
        }
        std::env::var_os("CARLA_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| {
                EvalError::ProcessLaunch(
                    "simulator root not configured and CARLA_PATH is not set".to_string(),
                )
            })
    }

    fn simulator_args(&self, town: &str, port: u16) -> Vec<String> {
        vec![
            format!("/Game/Maps/{}", town),
            "-windowed".to_string(),
            "-benchmark".to_string(),
            format!("-fps={}", self.simulator.fps),
            format!("-world-port={}", port),
        ]
    }

    pub fn launch_command(&self, request: &LaunchRequest, port: u16) -> Result<LaunchCommand, EvalError> {
        if request.docker {
            let mut args: Vec<String> = vec![
                "run".to_string(),
                "--rm".to_string(),
                "-d".to_string(),
                "-p".to_string(),
                format!(
                    "{}-{}:{}-{}",
                    port,
                    port.saturating_add(2),
                    port,
                    port.saturating_add(2)
                ),
                "--runtime=nvidia".to_string(),
                "-e".to_string(),
                format!("NVIDIA_VISIBLE_DEVICES={}", request.gpu),
                self.simulator.docker_image.clone(),
                "/bin/bash".to_string(),
                "CarlaUE4.sh".to_string(),
            ];
            args.extend(self.simulator_args(&request.town, port));
            return Ok(LaunchCommand {
                program: "docker".to_string(),
                args,
                env: Vec::new(),
            });
        }

        let binary = self
            .simulator_root()?
            .join("CarlaUE4")
            .join("Binaries")
            .join("Linux")
            .join("CarlaUE4")
            .to_string_lossy()
            .to_string();
        if request.no_screen {
            let mut args = vec!["-d".to_string(), format!(":7.{}", request.gpu), binary];
            args.extend(self.simulator_args(&request.town, port));
            Ok(LaunchCommand {
                program: "vglrun".to_string(),
                args,
                env: vec![("DISPLAY".to_string(), ":5".to_string())],
            })
        } else {
            Ok(LaunchCommand {
                program: binary,
                args: self.simulator_args(&request.town, port),
                env: vec![("SDL_HINT_CUDA_DEVICE".to_string(), request.gpu.clone())],
            })
        }
    }

    fn output_log_paths(&self) -> (PathBuf, PathBuf) {
        let pid = std::process::id();
        (
            self.output_logs_dir
                .join(format!("CARLA_{}_{}.out", self.process_name, pid)),
            self.output_logs_dir
                .join(format!("CARLA_err_{}_{}.out", self.process_name, pid)),
        )
    }
}

impl SimulatorSupervisor for CarlaSupervisor {
    fn start(&self, request: &LaunchRequest) -> Result<ProcessHandle, EvalError> {
        let port = allocate_port()
            .map_err(|e| EvalError::ProcessLaunch(format!("port allocation failed: {}", e)))?;
        let launch = self.launch_command(request, port)?;
        self.run_log
            .add_message("Loading", json!({ "CARLA": launch.display() }), None)?;
        info!(port, town = %request.town, docker = request.docker, "launching simulator");
        debug!(command = %launch.display(), "simulator invocation");

        if request.docker {
            let output = launch
                .to_command()
                .stdin(Stdio::null())
                .output()
                .map_err(|e| EvalError::ProcessLaunch(format!("failed to run docker: {}", e)))?;
            if !output.status.success() {
                let stderr_tail = String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("docker run exited without output")
                    .to_string();
                return Err(EvalError::ProcessLaunch(format!(
                    "docker run exited with {}: {}",
                    output.status, stderr_tail
                )));
            }
            let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if container_id.is_empty() {
                return Err(EvalError::ProcessLaunch(
                    "docker run did not report a container id".to_string(),
                ));
            }
            info!(port, container_id = %container_id, "simulator container started");
            return Ok(ProcessHandle::container(container_id, port));
        }

        ensure_dir(&self.output_logs_dir)?;
        let (stdout_log, stderr_log) = self.output_log_paths();
        let stdout = fs::File::create(&stdout_log)?;
        let stderr = fs::File::create(&stderr_log)?;
        let child = launch
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                EvalError::ProcessLaunch(format!("failed to spawn {}: {}", launch.program, e))
            })?;
        info!(port, pid = child.id(), "simulator process started");
        Ok(ProcessHandle::local(child, port, stdout_log, stderr_log))
    }

    fn stop(&self, handle: ProcessHandle) {
        let port = handle.port;
        if let Some(mut child) = handle.child {
            let pid = child.id();
            match child.kill() {
                Ok(()) => {
                    let _ = child.wait();
                    debug!(pid, port, "simulator process killed");
                }
                Err(e) => warn!(pid, port, error = %e, "failed to kill simulator process"),
            }
        }
        if let Some(container_id) = handle.container_id {
            let status = Command::new("docker")
                .args(["stop", &container_id])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => debug!(container_id = %container_id, "simulator container stopped"),
                Ok(s) => warn!(container_id = %container_id, status = %s, "docker stop failed"),
                Err(e) => warn!(container_id = %container_id, error = %e, "failed to run docker stop"),
            }
        }
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::run_log::RunLog;
    use crate::test_support::temp_root;
    use std::path::Path;

    fn supervisor(root: &Path, sim_root: Option<PathBuf>) -> CarlaSupervisor {
        let paths = RunPaths::new(root, "batch", "exp", "drive_TestSuite_Town01");
        let simulator = SimulatorConfig {
            root: sim_root,
            ..SimulatorConfig::default()
        };
        CarlaSupervisor::new(&simulator, &paths, RunLog::new(paths.run_log_path()))
    }

    fn request(docker: bool, no_screen: bool) -> LaunchRequest {
        LaunchRequest {
            gpu: "1".to_string(),
            town: "Town02".to_string(),
            no_screen,
            docker,
        }
    }

    #[test]
    fn docker_invocation_maps_port_range_and_gpu() {
        let root = temp_root("sup_docker");
        let sup = supervisor(&root, None);
        let cmd = sup.launch_command(&request(true, false), 2000).expect("cmd");
        assert_eq!(cmd.program, "docker");
        assert!(cmd.args.contains(&"2000-2002:2000-2002".to_string()));
        assert!(cmd.args.contains(&"NVIDIA_VISIBLE_DEVICES=1".to_string()));
        assert!(cmd.args.contains(&"carlagear".to_string()));
        assert!(cmd.args.contains(&"/Game/Maps/Town02".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("-world-port=2000"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn native_invocation_with_and_without_screen() {
        let root = temp_root("sup_native");
        let sup = supervisor(&root, Some(PathBuf::from("/opt/carla")));

        let on_screen = sup.launch_command(&request(false, false), 2100).expect("cmd");
        assert_eq!(on_screen.program, "/opt/carla/CarlaUE4/Binaries/Linux/CarlaUE4");
        assert_eq!(on_screen.args[0], "/Game/Maps/Town02");
        assert!(on_screen.args.contains(&"-fps=10".to_string()));
        assert_eq!(
            on_screen.env,
            vec![("SDL_HINT_CUDA_DEVICE".to_string(), "1".to_string())]
        );

        let headless = sup.launch_command(&request(false, true), 2100).expect("cmd");
        assert_eq!(headless.program, "vglrun");
        assert_eq!(&headless.args[..2], &["-d".to_string(), ":7.1".to_string()]);
        assert_eq!(headless.args[2], on_screen.program);
        assert_eq!(headless.env, vec![("DISPLAY".to_string(), ":5".to_string())]);
        assert!(headless.display().starts_with("vglrun -d :7.1 /opt/carla/"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_binary_is_a_launch_failure_and_logs_invocation() {
        let root = temp_root("sup_missing");
        let sup = supervisor(&root, Some(root.join("no_such_carla")));
        let err = sup.start(&request(false, false)).expect_err("spawn must fail");
        assert_eq!(err.kind(), ErrorKind::ProcessLaunch);

        let log_path = RunPaths::new(&root, "batch", "exp", "drive_TestSuite_Town01").run_log_path();
        let entries = RunLog::read_entries(&log_path).expect("run log");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag, "Loading");
        assert!(entries[0].payload["CARLA"]
            .as_str()
            .unwrap_or("")
            .contains("-world-port="));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn stop_kills_local_child() {
        let root = temp_root("sup_stop");
        let sup = supervisor(&root, None);
        let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id();
        let handle = ProcessHandle::local(child, 1, root.join("out"), root.join("err"));
        assert_eq!(handle.pid(), Some(pid));
        assert_eq!(handle.stdout_log(), Some(&root.join("out")));
        assert_eq!(handle.stderr_log(), Some(&root.join("err")));
        assert_eq!(handle.container_id(), None);
        sup.stop(handle);
        // Reaped by stop(); signalling the pid again must fail.
        let alive = Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .expect("kill -0");
        assert!(!alive.success());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stop_on_detached_handle_is_noop() {
        let root = temp_root("sup_detached");
        let sup = supervisor(&root, None);
        let handle = ProcessHandle::detached(2000);
        assert_eq!(handle.port(), 2000);
        assert_eq!(handle.pid(), None);
        sup.stop(handle);
        let container = ProcessHandle::container("abc123".to_string(), 2001);
        assert_eq!(container.container_id(), Some("abc123"));
        assert_eq!(container.stdout_log(), None);
        let _ = fs::remove_dir_all(root);
    }
}
