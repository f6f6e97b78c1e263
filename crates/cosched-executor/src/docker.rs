//! Container control through the docker CLI.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use cosched_core::{CoreSet, UnitId, UnitStatus};

use crate::error::{ExecutorError, ExecutorResult};
use crate::runtime::{LaunchSpec, UnitRuntime};

const INSPECT_FORMAT: &str = "{{.State.Status}} {{.State.ExitCode}} {{.State.Pid}}";

/// Runs each job as a detached container named `<prefix>-<job>`.
///
/// Adopting an existing process is not supported; the service is attached
/// through a [`ProcessRuntime`](crate::ProcessRuntime) instead.
#[derive(Debug)]
pub struct DockerRuntime {
    docker_bin: String,
    prefix: String,
    containers: Mutex<HashMap<UnitId, String>>,
}

impl DockerRuntime {
    pub fn new(docker_bin: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            prefix: prefix.into(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn container_name(&self, unit: &UnitId) -> String {
        let name: String = unit
            .name()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}-{name}", self.prefix)
    }

    async fn container(&self, unit: &UnitId) -> ExecutorResult<String> {
        self.containers
            .lock()
            .await
            .get(unit)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownUnit(unit.clone()))
    }

    /// Run one docker command; stdout on success, stderr as the error.
    async fn docker(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("{}: {e}", self.docker_bin))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    async fn run_op(&self, unit: &UnitId, op: &'static str, args: &[&str]) -> ExecutorResult<String> {
        self.docker(args)
            .await
            .map_err(|reason| ExecutorError::runtime(unit, op, reason))
    }

    async fn inspect(&self, unit: &UnitId) -> ExecutorResult<(UnitStatus, Option<u32>)> {
        let name = self.container(unit).await?;
        let out = self
            .run_op(unit, "inspect", &["inspect", "--format", INSPECT_FORMAT, &name])
            .await?;
        parse_inspect(&out).map_err(|reason| ExecutorError::runtime(unit, "inspect", reason))
    }
}

#[async_trait]
impl UnitRuntime for DockerRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> ExecutorResult<()> {
        let launch_err = |reason: String| ExecutorError::Launch {
            unit: spec.unit.clone(),
            reason,
        };
        let image = spec
            .image
            .as_deref()
            .ok_or_else(|| launch_err("no image configured".to_string()))?;
        let name = self.container_name(&spec.unit);
        let cpuset = spec.cores.to_string();

        // A leftover container from an earlier run would block the name.
        if let Err(e) = self.docker(&["rm", "-f", &name]).await {
            warn!(container = %name, error = %e, "removing leftover container failed");
        }

        let mut args = vec![
            "run",
            "-d",
            "--name",
            name.as_str(),
            "--cpuset-cpus",
            cpuset.as_str(),
            image,
        ];
        args.extend(spec.command.iter().map(String::as_str));
        let id = self.docker(&args).await.map_err(launch_err)?;

        debug!(unit = %spec.unit, container = %name, id = %id, cores = %cpuset, "container started");
        self.containers.lock().await.insert(spec.unit.clone(), name);
        Ok(())
    }

    async fn attach(&self, _unit: &UnitId, _pid: u32) -> ExecutorResult<()> {
        Err(ExecutorError::Unsupported("attaching to a pid"))
    }

    async fn set_affinity(&self, unit: &UnitId, cores: &CoreSet) -> ExecutorResult<()> {
        let name = self.container(unit).await?;
        let cpuset = cores.to_string();
        self.run_op(unit, "set_affinity", &["update", "--cpuset-cpus", &cpuset, &name])
            .await
            .map(|_| ())
    }

    async fn pause(&self, unit: &UnitId) -> ExecutorResult<()> {
        let name = self.container(unit).await?;
        self.run_op(unit, "pause", &["pause", &name]).await.map(|_| ())
    }

    async fn resume(&self, unit: &UnitId) -> ExecutorResult<()> {
        let name = self.container(unit).await?;
        self.run_op(unit, "resume", &["unpause", &name]).await.map(|_| ())
    }

    async fn signal_stop(&self, unit: &UnitId) -> ExecutorResult<()> {
        let name = self.container(unit).await?;
        match self.docker(&["kill", "--signal", "SIGTERM", &name]).await {
            Ok(_) => Ok(()),
            Err(reason) if is_not_running(&reason) => Ok(()),
            Err(reason) => Err(ExecutorError::runtime(unit, "stop", reason)),
        }
    }

    async fn kill(&self, unit: &UnitId) -> ExecutorResult<()> {
        let name = self.container(unit).await?;
        match self.docker(&["kill", "--signal", "SIGKILL", &name]).await {
            Ok(_) => Ok(()),
            Err(reason) if is_not_running(&reason) => Ok(()),
            Err(reason) => Err(ExecutorError::runtime(unit, "kill", reason)),
        }
    }

    async fn status(&self, unit: &UnitId) -> ExecutorResult<UnitStatus> {
        self.inspect(unit).await.map(|(status, _)| status)
    }

    async fn pid(&self, unit: &UnitId) -> Option<u32> {
        self.inspect(unit).await.ok().and_then(|(_, pid)| pid)
    }

    async fn release(&self, unit: &UnitId) -> ExecutorResult<()> {
        let Some(name) = self.containers.lock().await.remove(unit) else {
            return Ok(());
        };
        self.run_op(unit, "release", &["rm", "-f", &name]).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

// ── Internal helpers ────────────────────────────────────────────

/// Parse `inspect` output in [`INSPECT_FORMAT`].
pub fn parse_inspect(line: &str) -> Result<(UnitStatus, Option<u32>), String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let &[state, code, pid] = fields.as_slice() else {
        return Err(format!("unexpected inspect output: {line:?}"));
    };
    let code: i32 = code
        .parse()
        .map_err(|_| format!("bad exit code in {line:?}"))?;
    let pid: u32 = pid.parse().map_err(|_| format!("bad pid in {line:?}"))?;

    let status = match state {
        "created" | "running" | "restarting" => UnitStatus::Running,
        "paused" => UnitStatus::Paused,
        "exited" | "dead" | "removing" => UnitStatus::Exited(code),
        other => return Err(format!("unknown container state {other:?}")),
    };
    Ok((status, (pid != 0).then_some(pid)))
}

fn is_not_running(stderr: &str) -> bool {
    stderr.contains("is not running")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inspect_states() {
        assert_eq!(
            parse_inspect("running 0 4321").unwrap(),
            (UnitStatus::Running, Some(4321))
        );
        assert_eq!(
            parse_inspect("paused 0 4321").unwrap(),
            (UnitStatus::Paused, Some(4321))
        );
        assert_eq!(
            parse_inspect("exited 137 0").unwrap(),
            (UnitStatus::Exited(137), None)
        );
        assert!(parse_inspect("running 0").is_err());
        assert!(parse_inspect("sleeping 0 1").is_err());
    }

    #[test]
    fn container_names_are_sanitized() {
        let rt = DockerRuntime::new("docker", "cosched");
        assert_eq!(
            rt.container_name(&UnitId::job("parsec/dedup 2")),
            "cosched-parsec-dedup-2"
        );
    }

    #[tokio::test]
    async fn launch_without_image_fails_before_calling_docker() {
        let rt = DockerRuntime::new("/nonexistent/docker", "cosched");
        let spec = LaunchSpec {
            unit: UnitId::job("dedup"),
            cores: CoreSet::from([1]),
            threads: 1,
            command: vec![],
            image: None,
        };
        assert!(matches!(
            rt.launch(&spec).await,
            Err(ExecutorError::Launch { reason, .. }) if reason.contains("image")
        ));
    }

    #[tokio::test]
    async fn missing_docker_binary_is_a_launch_error() {
        let rt = DockerRuntime::new("/nonexistent/docker", "cosched");
        let spec = LaunchSpec {
            unit: UnitId::job("dedup"),
            cores: CoreSet::from([1]),
            threads: 1,
            command: vec![],
            image: Some("busybox".to_string()),
        };
        assert!(matches!(
            rt.launch(&spec).await,
            Err(ExecutorError::Launch { .. })
        ));
        assert!(matches!(
            rt.status(&spec.unit).await,
            Err(ExecutorError::UnknownUnit(_))
        ));
    }
}
