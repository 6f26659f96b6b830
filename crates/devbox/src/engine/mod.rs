//! Container engine client.
//!
//! Thin adapter over the docker or podman CLI. Every call shells out to the
//! engine binary; all calls are fallible and possibly slow, so nothing here
//! is invoked while holding a cross-user lock.

mod error;
mod types;

pub use error::{EngineError, EngineResult};
pub use types::{ContainerSpec, EngineState, EngineStats, ExecOutput};

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use types::{validate_container_ref, validate_image_name};

/// Engine operations the orchestrator depends on.
///
/// Abstracted behind a trait so tests can run against a fake engine.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Ensure the base image exists locally, building or pulling it if not.
    async fn build_image_if_absent(&self, image: &str) -> EngineResult<()>;

    /// Create and start a container, returning the engine-assigned ID.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;
    async fn stop_container(&self, id: &str) -> EngineResult<()>;
    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;

    /// Run a command inside the container and wait for its output, bounded
    /// by `timeout`. The in-container process is not guaranteed killed on
    /// timeout; only the control-plane call returns.
    async fn exec(&self, id: &str, command: &str, timeout: Duration) -> EngineResult<ExecOutput>;

    /// Run a command inside the container detached (fire-and-forget).
    async fn exec_detached(&self, id: &str, command: &str) -> EngineResult<()>;

    /// Live state for a container, or `None` if the engine does not know it.
    async fn inspect(&self, id: &str) -> EngineResult<Option<EngineState>>;

    /// Single resource-usage snapshot.
    async fn stats(&self, id: &str) -> EngineResult<EngineStats>;
}

/// Container engine flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    #[default]
    Docker,
    Podman,
}

impl EngineKind {
    pub fn binary(&self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }
}

/// CLI-backed engine client.
#[derive(Debug, Clone)]
pub struct CliEngine {
    binary: String,
    /// Build context directory; when set, a missing image is built from it
    /// instead of pulled.
    build_context: Option<PathBuf>,
}

impl CliEngine {
    /// Auto-detect an available engine binary, preferring docker.
    pub fn detect(build_context: Option<PathBuf>) -> Self {
        let kind = if Self::binary_available("docker") {
            EngineKind::Docker
        } else if Self::binary_available("podman") {
            EngineKind::Podman
        } else {
            // Will fail with Unavailable on first use.
            EngineKind::Docker
        };
        Self {
            binary: kind.binary().to_string(),
            build_context,
        }
    }

    /// Use a specific binary path (e.g. from configuration).
    pub fn with_binary(binary: impl Into<String>, build_context: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            build_context,
        }
    }

    fn binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run an engine subcommand and return its stdout.
    async fn run(&self, op: &str, args: &[&str]) -> EngineResult<String> {
        debug!(binary = %self.binary, op, "engine call");
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::from_command(op, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl EngineApi for CliEngine {
    async fn build_image_if_absent(&self, image: &str) -> EngineResult<()> {
        validate_image_name(image)?;

        let exists = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.binary)))?
            .status
            .success();
        if exists {
            return Ok(());
        }

        let result = match &self.build_context {
            Some(ctx) => {
                let ctx = ctx.display().to_string();
                self.run("build", &["build", "-t", image, &ctx]).await
            }
            None => self.run("pull", &["pull", image]).await,
        };

        match result {
            Ok(_) => Ok(()),
            Err(EngineError::Unavailable(msg)) => Err(EngineError::Unavailable(msg)),
            Err(err) => Err(EngineError::BuildFailed(err.to_string())),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        spec.validate()?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--memory".into(),
            spec.ram_limit.clone(),
            "--cpus".into(),
            spec.cpu_threads.to_string(),
            "--restart".into(),
            "on-failure".into(),
            // Publish SSH on an engine-assigned host port.
            "-p".into(),
            "22".into(),
        ];

        if spec.gpu {
            args.push("--gpus".into());
            args.push("all".into());
        }

        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image.clone());
        // Keep the container alive; users get in over SSH or the web terminal.
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run("run", &arg_refs).await?;
        Ok(stdout.trim().to_string())
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        validate_container_ref(id)?;
        self.run("start", &["start", id]).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        validate_container_ref(id)?;
        self.run("stop", &["stop", "-t", "10", id]).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        validate_container_ref(id)?;
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(id);
        self.run("rm", &args).await.map(|_| ())
    }

    async fn exec(&self, id: &str, command: &str, timeout: Duration) -> EngineResult<ExecOutput> {
        validate_container_ref(id)?;

        let child = Command::new(&self.binary)
            .args(["exec", id, "sh", "-lc", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.binary)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| EngineError::Timeout {
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.binary)))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_detached(&self, id: &str, command: &str) -> EngineResult<()> {
        validate_container_ref(id)?;
        self.run("exec", &["exec", "-d", id, "sh", "-c", command])
            .await
            .map(|_| ())
    }

    async fn inspect(&self, id: &str) -> EngineResult<Option<EngineState>> {
        validate_container_ref(id)?;

        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Status}}", id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.binary)))?;

        if !output.status.success() {
            // Unknown container is not an error at this layer.
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if status.is_empty() {
            return Ok(None);
        }

        let ssh_port = self.published_ssh_port(id).await?;
        Ok(Some(EngineState { status, ssh_port }))
    }

    async fn stats(&self, id: &str) -> EngineResult<EngineStats> {
        validate_container_ref(id)?;

        let stdout = self
            .run(
                "stats",
                &["stats", "--no-stream", "--format", "json", id],
            )
            .await?;

        // Docker emits one JSON object per line.
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        serde_json::from_str(line).map_err(|e| EngineError::ParseError(e.to_string()))
    }
}

impl CliEngine {
    /// Host port the container's port 22 is published on, if any.
    async fn published_ssh_port(&self, id: &str) -> EngineResult<Option<u16>> {
        let output = Command::new(&self.binary)
            .args(["port", id, "22/tcp"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.binary)))?;

        if !output.status.success() {
            return Ok(None);
        }

        // Output looks like "0.0.0.0:49155" (possibly one line per address).
        let stdout = String::from_utf8_lossy(&output.stdout);
        let port = stdout
            .lines()
            .filter_map(|line| line.trim().rsplit(':').next())
            .find_map(|p| p.parse::<u16>().ok());
        Ok(port)
    }
}
