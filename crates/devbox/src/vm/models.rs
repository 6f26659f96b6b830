//! Container record data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::EngineStats;

/// Lifecycle state of a user's container.
///
/// `DESTROYED` has no variant: a destroyed container simply has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Record persisted, engine call in flight.
    Creating,
    Running,
    Stopped,
    /// Creation failed; the record stays so the error is visible until the
    /// user destroys it.
    Failed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Creating => write!(f, "creating"),
            VmState::Running => write!(f, "running"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(VmState::Creating),
            "running" => Ok(VmState::Running),
            "stopped" => Ok(VmState::Stopped),
            "failed" => Ok(VmState::Failed),
            _ => Err(format!("unknown vm state: {s}")),
        }
    }
}

impl TryFrom<String> for VmState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Persisted row representing one user's provisioned environment.
///
/// The record is the source of truth for "does this user have a VM"; the
/// engine is the source of truth for "is it actually running".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContainerRecord {
    pub user_id: i64,
    /// Engine-assigned ID; `None` while still `Creating` or when creation
    /// failed before the engine returned one.
    pub engine_id: Option<String>,
    /// Engine-side container name (`devbox-user-<id>`).
    pub name: String,
    #[sqlx(try_from = "String")]
    pub state: VmState,
    /// Plan snapshot: the plan ID and its limits at creation time.
    pub plan_id: String,
    pub ram_limit: String,
    pub cpu_threads: i64,
    pub gpu: bool,
    /// Host port SSH is published on.
    pub ssh_port: Option<i64>,
    pub ssh_user: String,
    pub ssh_password: String,
    pub created_at: String,
}

/// Reconciled status returned by the `status` operation.
#[derive(Debug, Clone)]
pub struct VmStatus {
    pub record: ContainerRecord,
    /// Live usage snapshot, present only while running.
    pub stats: Option<EngineStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_string_roundtrip() {
        for state in [
            VmState::Creating,
            VmState::Running,
            VmState::Stopped,
            VmState::Failed,
        ] {
            let parsed: VmState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("gone".parse::<VmState>().is_err());
    }
}
