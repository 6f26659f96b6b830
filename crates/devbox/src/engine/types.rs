//! Engine request/response types and input validation.

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};

/// Everything the engine needs to create one dev container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (unique per user).
    pub name: String,
    /// Image tag to run.
    pub image: String,
    /// RAM limit in engine units (e.g. "2g").
    pub ram_limit: String,
    /// CPU thread count.
    pub cpu_threads: i64,
    /// Whether to pass GPUs through.
    pub gpu: bool,
    /// Environment variables.
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    pub fn validate(&self) -> EngineResult<()> {
        validate_container_ref(&self.name)?;
        validate_image_name(&self.image)?;
        if !self
            .ram_limit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.')
        {
            return Err(EngineError::InvalidInput(format!(
                "ram limit '{}' contains invalid characters",
                self.ram_limit
            )));
        }
        if self.cpu_threads < 1 {
            return Err(EngineError::InvalidInput(
                "cpu thread count must be at least 1".to_string(),
            ));
        }
        for (key, _) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
                return Err(EngineError::InvalidInput(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
        }
        Ok(())
    }
}

/// Live state reported by the engine for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    /// Raw status string, e.g. "running", "exited", "created".
    pub status: String,
    /// Host port the container's SSH port is published on, if any.
    pub ssh_port: Option<u16>,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Result of running a command inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    /// Stdout and stderr interleaved the way a terminal would show them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Single stats snapshot as reported by `stats --no-stream --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    #[serde(rename = "CPUPerc", default)]
    pub cpu_percent: String,
    #[serde(rename = "MemUsage", default)]
    pub mem_usage: String,
    #[serde(rename = "MemPerc", default)]
    pub mem_percent: String,
}

/// Validate a container ID or name before passing it to the engine CLI.
///
/// IDs are hex strings, names are alphanumeric with `-` and `_`.
pub fn validate_container_ref(id: &str) -> EngineResult<()> {
    if id.is_empty() {
        return Err(EngineError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }
    if id.len() > 128 {
        return Err(EngineError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "container ID or name '{id}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate an image reference (`registry/name:tag`).
pub fn validate_image_name(image: &str) -> EngineResult<()> {
    if image.is_empty() {
        return Err(EngineError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(EngineError::InvalidInput(
            "image name exceeds maximum length".to_string(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@')
    };
    if !image.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    Ok(())
}
