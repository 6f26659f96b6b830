//! Lifecycle orchestrator.
//!
//! Owns the decision logic for every container operation: validates the
//! caller against the allow-list, plan and maintenance gate, serializes
//! mutating operations per user, drives the engine client, and keeps the
//! persisted record consistent with the engine's observed outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::engine::{ContainerSpec, EngineApi, EngineState};
use crate::plan::PlanRepository;
use crate::settings::{GlobalSettings, SettingsRepository};
use crate::tunnel::{TunnelManager, TunnelSession};
use crate::user::{AllowedUser, UserRepository};

use super::error::{OrchestratorError, OrchestratorResult};
use super::models::{ContainerRecord, VmState, VmStatus};
use super::repository::VmRepository;

/// Prefix for engine-side container names managed by this control plane.
const CONTAINER_NAME_PREFIX: &str = "devbox-user-";

/// Unix account provisioned inside every container.
const SSH_USER: &str = "devuser";

/// Ceiling on in-container command execution.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Exec output is truncated to this many bytes before it is returned.
const EXEC_OUTPUT_LIMIT: usize = 4000;

/// How many one-second polls to give a fresh container to reach "running".
const START_WAIT_ATTEMPTS: u32 = 10;

fn generate_password(length: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// The container lifecycle orchestrator.
///
/// Mutating operations for one user are serialized through a per-user lock;
/// operations for different users proceed concurrently, and no lock is held
/// across an engine call for anyone else's user.
#[derive(Clone)]
pub struct Orchestrator {
    repo: VmRepository,
    users: UserRepository,
    plans: PlanRepository,
    settings: SettingsRepository,
    engine: Arc<dyn EngineApi>,
    tunnels: TunnelManager,
    user_locks: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
    /// Image build gate: at most one build in flight process-wide, and only
    /// the first create pays for it.
    image_built: Arc<tokio::sync::Mutex<bool>>,
    image: String,
}

impl Orchestrator {
    pub fn new(db: &Database, engine: Arc<dyn EngineApi>, image: impl Into<String>) -> Self {
        let pool = db.pool().clone();
        Self {
            repo: VmRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            settings: SettingsRepository::new(pool),
            tunnels: TunnelManager::new(engine.clone()),
            engine,
            user_locks: Arc::new(Mutex::new(HashMap::new())),
            image_built: Arc::new(tokio::sync::Mutex::new(false)),
            image: image.into(),
        }
    }

    /// Replace the tunnel manager (used by tests to shorten timeouts).
    #[cfg(test)]
    pub(crate) fn with_tunnels(mut self, tunnels: TunnelManager) -> Self {
        self.tunnels = tunnels;
        self
    }

    fn user_lock(&self, user_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .clone()
    }

    fn container_name(user_id: i64) -> String {
        format!("{CONTAINER_NAME_PREFIX}{user_id}")
    }

    /// Ensure the base image exists; at most one build runs at a time.
    async fn ensure_image(&self) -> OrchestratorResult<()> {
        let mut built = self.image_built.lock().await;
        if *built {
            return Ok(());
        }
        self.engine.build_image_if_absent(&self.image).await?;
        *built = true;
        Ok(())
    }

    /// Resolve the limits for a new container: the user's plan, or the
    /// global defaults if the plan row has gone missing.
    async fn resolve_limits(
        &self,
        user: &AllowedUser,
        settings: &GlobalSettings,
    ) -> OrchestratorResult<(String, i64, bool)> {
        match self.plans.get(&user.plan_id).await? {
            Some(plan) => Ok((plan.ram_limit, plan.cpu_threads, plan.gpu && settings.default_gpu)),
            None => {
                warn!(
                    user_id = user.user_id,
                    plan_id = %user.plan_id,
                    "plan missing, falling back to global defaults"
                );
                Ok((
                    settings.default_ram.clone(),
                    settings.default_cpu,
                    settings.default_gpu,
                ))
            }
        }
    }

    /// Create a container for `user_id`.
    ///
    /// The record is persisted in `Creating` before the engine call and
    /// flipped to `Running` or `Failed` with the engine's reported outcome.
    /// Engine failures surface verbatim; nothing is retried.
    pub async fn create(&self, user_id: i64) -> OrchestratorResult<ContainerRecord> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(OrchestratorError::NotAuthorized(user_id))?;

        let settings = self.settings.get().await?;
        if settings.maintenance {
            return Err(OrchestratorError::MaintenanceActive);
        }

        if self.repo.get(user_id).await?.is_some() {
            return Err(OrchestratorError::AlreadyExists(user_id));
        }

        self.ensure_image().await?;

        let (ram_limit, cpu_threads, gpu) = self.resolve_limits(&user, &settings).await?;
        let name = Self::container_name(user_id);
        let password = generate_password(12);

        let record = ContainerRecord {
            user_id,
            engine_id: None,
            name: name.clone(),
            state: VmState::Creating,
            plan_id: user.plan_id.clone(),
            ram_limit: ram_limit.clone(),
            cpu_threads,
            gpu,
            ssh_port: None,
            ssh_user: SSH_USER.to_string(),
            ssh_password: password.clone(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.repo.insert(&record).await?;

        // A stale container with our name can survive a crash between the
        // engine call and record cleanup; clear it before creating.
        if let Err(err) = self.engine.remove_container(&name, true).await {
            debug!(user_id, %err, "no stale container to remove");
        }

        let spec = ContainerSpec {
            name,
            image: self.image.clone(),
            ram_limit,
            cpu_threads,
            gpu,
            env: vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())],
        };

        match self.provision(&spec, &password).await {
            Ok((engine_id, ssh_port)) => {
                self.repo.mark_started(user_id, &engine_id, ssh_port).await?;
                info!(user_id, engine_id, "container created");
                let record = self
                    .repo
                    .get(user_id)
                    .await?
                    .ok_or(OrchestratorError::NotFound(user_id))?;
                Ok(record)
            }
            Err(err) => {
                self.repo.update_state(user_id, VmState::Failed).await?;
                Err(err)
            }
        }
    }

    /// Engine-side half of create: run the container, wait for it to come
    /// up, provision SSH credentials, read back the published port.
    async fn provision(
        &self,
        spec: &ContainerSpec,
        password: &str,
    ) -> OrchestratorResult<(String, Option<i64>)> {
        let engine_id = self.engine.create_container(spec).await?;

        let mut attempts = 0;
        let state: EngineState = loop {
            if let Some(state) = self.engine.inspect(&engine_id).await? {
                if state.is_running() {
                    break state;
                }
            }
            attempts += 1;
            if attempts >= START_WAIT_ATTEMPTS {
                // Leave nothing behind from a container that never came up.
                if let Err(err) = self.engine.remove_container(&engine_id, true).await {
                    warn!(engine_id, %err, "cleanup of dead container failed");
                }
                return Err(OrchestratorError::Timeout {
                    op: "container start",
                    seconds: START_WAIT_ATTEMPTS as u64,
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        let cmd = format!(
            "id -u {SSH_USER} >/dev/null 2>&1 || useradd -m -s /bin/bash {SSH_USER}; \
             echo {SSH_USER}:{password} | chpasswd"
        );
        match self.engine.exec(&engine_id, &cmd, EXEC_TIMEOUT).await {
            Ok(out) if out.exit_code != 0 => {
                warn!(engine_id, stderr = %out.stderr, "ssh credential setup failed");
            }
            Err(err) => warn!(engine_id, %err, "ssh credential setup failed"),
            Ok(_) => {}
        }

        Ok((engine_id, state.ssh_port.map(i64::from)))
    }

    /// Start a stopped container. The record only moves to `Running` after
    /// the engine confirms.
    pub async fn start(&self, user_id: i64) -> OrchestratorResult<ContainerRecord> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let record = self
            .repo
            .get(user_id)
            .await?
            .ok_or(OrchestratorError::NotFound(user_id))?;

        if self.settings.get().await?.maintenance {
            return Err(OrchestratorError::MaintenanceActive);
        }

        let engine_id = record
            .engine_id
            .as_deref()
            .ok_or(OrchestratorError::NotFound(user_id))?;

        self.engine.start_container(engine_id).await?;
        self.repo.update_state(user_id, VmState::Running).await?;
        self.repo
            .get(user_id)
            .await?
            .ok_or(OrchestratorError::NotFound(user_id))
    }

    /// Stop a running container. The record only moves to `Stopped` after
    /// the engine confirms; a failed engine stop leaves the record alone.
    pub async fn stop(&self, user_id: i64) -> OrchestratorResult<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.stop_locked(user_id).await
    }

    async fn stop_locked(&self, user_id: i64) -> OrchestratorResult<()> {
        let record = self
            .repo
            .get(user_id)
            .await?
            .ok_or(OrchestratorError::NotFound(user_id))?;

        self.tunnels.close(user_id, record.engine_id.as_deref()).await;

        if let Some(engine_id) = record.engine_id.as_deref() {
            self.engine.stop_container(engine_id).await?;
        }
        self.repo.update_state(user_id, VmState::Stopped).await?;
        Ok(())
    }

    /// Destroy a user's container and its record.
    ///
    /// Idempotent: destroying an absent container is a no-op success. The
    /// record is removed even when the engine-side removal fails, except
    /// when the engine itself is unreachable (so a retry can still work).
    pub async fn destroy(&self, user_id: i64) -> OrchestratorResult<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let Some(record) = self.repo.get(user_id).await? else {
            return Ok(());
        };

        self.tunnels.close(user_id, record.engine_id.as_deref()).await;

        let target = record.engine_id.as_deref().unwrap_or(&record.name);
        match self.engine.remove_container(target, true).await {
            Ok(()) => {}
            Err(err @ crate::engine::EngineError::Unavailable(_)) => return Err(err.into()),
            Err(err) => {
                warn!(user_id, %err, "engine removal failed, dropping record anyway");
            }
        }

        self.repo.delete(user_id).await?;
        info!(user_id, "container destroyed");
        Ok(())
    }

    /// Run a command inside the user's container, bounded in time and
    /// output size. A timed-out command keeps running inside the container;
    /// only this call returns.
    pub async fn exec(&self, user_id: i64, command: &str) -> OrchestratorResult<String> {
        let record = self
            .repo
            .get(user_id)
            .await?
            .ok_or(OrchestratorError::NotFound(user_id))?;
        if record.state != VmState::Running {
            return Err(OrchestratorError::NotFound(user_id));
        }
        let engine_id = record
            .engine_id
            .as_deref()
            .ok_or(OrchestratorError::NotFound(user_id))?;

        let output = self.engine.exec(engine_id, command, EXEC_TIMEOUT).await?;
        let mut combined = output.combined();
        if combined.len() > EXEC_OUTPUT_LIMIT {
            combined.truncate(EXEC_OUTPUT_LIMIT);
            combined.push_str("\n... (truncated)");
        }
        Ok(combined)
    }

    /// Reconciled status: the engine is the authority at read time.
    ///
    /// If the engine disagrees with the record, the record is corrected to
    /// match before being returned; a container the engine no longer knows
    /// means the record is dropped and `NotFound` is returned. Holds the
    /// user's lock so the corrective write cannot interleave with a
    /// concurrent lifecycle operation.
    pub async fn status(&self, user_id: i64) -> OrchestratorResult<VmStatus> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let record = self
            .repo
            .get(user_id)
            .await?
            .ok_or(OrchestratorError::NotFound(user_id))?;

        let Some(engine_id) = record.engine_id.clone() else {
            // Creating or failed-before-create: no engine truth to consult.
            return Ok(VmStatus {
                record,
                stats: None,
            });
        };

        let Some(live) = self.engine.inspect(&engine_id).await? else {
            warn!(user_id, engine_id, "engine lost container, dropping record");
            self.repo.delete(user_id).await?;
            return Err(OrchestratorError::NotFound(user_id));
        };

        let observed = if live.is_running() {
            VmState::Running
        } else {
            VmState::Stopped
        };
        if observed != record.state {
            info!(
                user_id,
                recorded = %record.state,
                observed = %observed,
                "reconciling container state"
            );
            self.repo.update_state(user_id, observed).await?;
        }

        let record = self
            .repo
            .get(user_id)
            .await?
            .ok_or(OrchestratorError::NotFound(user_id))?;

        let stats = if observed == VmState::Running {
            self.engine.stats(&engine_id).await.ok()
        } else {
            None
        };

        Ok(VmStatus { record, stats })
    }

    /// Flip the maintenance gate. Turning it on stops every running
    /// container first (best-effort, one failure does not abort the sweep)
    /// and only then persists the flag. Returns how many containers were
    /// stopped.
    pub async fn set_maintenance(&self, on: bool) -> OrchestratorResult<usize> {
        if !on {
            self.settings.set_maintenance(false).await?;
            return Ok(0);
        }

        let mut stopped = 0;
        for record in self.repo.list().await? {
            if record.state != VmState::Running {
                continue;
            }
            let lock = self.user_lock(record.user_id);
            let _guard = lock.lock().await;
            match self.stop_locked(record.user_id).await {
                Ok(()) => stopped += 1,
                Err(err) => {
                    warn!(user_id = record.user_id, %err, "maintenance sweep stop failed");
                }
            }
        }

        self.settings.set_maintenance(true).await?;
        info!(stopped, "maintenance mode enabled");
        Ok(stopped)
    }

    /// Admin stop on behalf of another user: same path as `stop`, the
    /// elevated authorization lives in the dispatcher.
    pub async fn force_stop(&self, user_id: i64) -> OrchestratorResult<()> {
        self.stop(user_id).await
    }

    /// Destroy every container (admin bulk teardown). Best-effort per
    /// container; returns how many records were removed.
    pub async fn destroy_all(&self) -> OrchestratorResult<usize> {
        let mut destroyed = 0;
        for record in self.repo.list().await? {
            match self.destroy(record.user_id).await {
                Ok(()) => destroyed += 1,
                Err(err) => {
                    warn!(user_id = record.user_id, %err, "bulk destroy failed for user");
                }
            }
        }
        Ok(destroyed)
    }

    /// Open (or supersede) the web terminal for a user's container.
    pub async fn web_terminal(&self, user_id: i64) -> OrchestratorResult<TunnelSession> {
        // Reconcile first so we never tunnel into a container the engine
        // has stopped behind our back.
        let status = self.status(user_id).await?;
        self.tunnels.open(&status.record).await
    }

    // Pass-throughs so the dispatcher needs a single handle.

    pub async fn global_settings(&self) -> OrchestratorResult<GlobalSettings> {
        Ok(self.settings.get().await?)
    }

    pub async fn set_default_gpu(&self, on: bool) -> OrchestratorResult<()> {
        Ok(self.settings.set_default_gpu(on).await?)
    }

    pub async fn set_default_ram(&self, value: &str) -> OrchestratorResult<()> {
        Ok(self.settings.set_default_ram(value).await?)
    }

    pub async fn set_default_cpu(&self, threads: i64) -> OrchestratorResult<()> {
        Ok(self.settings.set_default_cpu(threads).await?)
    }

    pub async fn allow_user(
        &self,
        user_id: i64,
        plan_id: &str,
        username: Option<&str>,
        added_by: Option<i64>,
    ) -> OrchestratorResult<()> {
        if self.plans.get(plan_id).await?.is_none() {
            return Err(OrchestratorError::Store(anyhow::anyhow!(
                "unknown plan: {plan_id}"
            )));
        }
        Ok(self.users.allow(user_id, plan_id, username, added_by).await?)
    }

    /// Remove a user from the allow-list. Does NOT destroy their container;
    /// the returned name, if any, tells the admin what is still provisioned.
    pub async fn remove_user(&self, user_id: i64) -> OrchestratorResult<Option<String>> {
        self.users.remove(user_id).await?;
        let leftover = self.repo.get(user_id).await?.map(|r| r.name);
        if let Some(name) = &leftover {
            warn!(user_id, container = %name, "user removed from allow-list but container remains");
        }
        Ok(leftover)
    }

    pub async fn list_allowed(&self) -> OrchestratorResult<Vec<AllowedUser>> {
        Ok(self.users.list().await?)
    }

    pub async fn list_containers(&self) -> OrchestratorResult<Vec<ContainerRecord>> {
        Ok(self.repo.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineResult, EngineStats, ExecOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Stateful fake engine: tracks container states by engine ID so tests
    /// can simulate out-of-band changes.
    #[derive(Default)]
    struct FakeEngine {
        states: Mutex<HashMap<String, String>>,
        create_calls: Mutex<usize>,
        build_calls: Mutex<usize>,
        stop_calls: Mutex<usize>,
        fail_create: Mutex<Option<String>>,
        fail_stop: Mutex<bool>,
        exec_stdout: Mutex<String>,
        exec_delay: Mutex<Option<Duration>>,
        detached: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        fn set_state(&self, id: &str, status: &str) {
            self.states
                .lock()
                .unwrap()
                .insert(id.to_string(), status.to_string());
        }

        fn forget(&self, id: &str) {
            self.states.lock().unwrap().remove(id);
        }
    }

    #[async_trait]
    impl EngineApi for FakeEngine {
        async fn build_image_if_absent(&self, _image: &str) -> EngineResult<()> {
            *self.build_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn create_container(&self, _spec: &ContainerSpec) -> EngineResult<String> {
            if let Some(msg) = self.fail_create.lock().unwrap().clone() {
                return Err(EngineError::Unavailable(msg));
            }
            let mut calls = self.create_calls.lock().unwrap();
            *calls += 1;
            let id = format!("eng-{}", *calls);
            drop(calls);
            self.set_state(&id, "running");
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> EngineResult<()> {
            let mut states = self.states.lock().unwrap();
            match states.get_mut(id) {
                Some(status) => {
                    *status = "running".to_string();
                    Ok(())
                }
                None => Err(EngineError::NotFound(id.to_string())),
            }
        }

        async fn stop_container(&self, id: &str) -> EngineResult<()> {
            *self.stop_calls.lock().unwrap() += 1;
            if *self.fail_stop.lock().unwrap() {
                return Err(EngineError::CommandFailed {
                    command: "stop".to_string(),
                    message: "boom".to_string(),
                });
            }
            let mut states = self.states.lock().unwrap();
            match states.get_mut(id) {
                Some(status) => {
                    *status = "exited".to_string();
                    Ok(())
                }
                None => Err(EngineError::NotFound(id.to_string())),
            }
        }

        async fn remove_container(&self, id: &str, _force: bool) -> EngineResult<()> {
            self.states.lock().unwrap().remove(id);
            Ok(())
        }

        async fn exec(
            &self,
            _id: &str,
            _command: &str,
            timeout: Duration,
        ) -> EngineResult<ExecOutput> {
            // Honors the deadline contract: a command slower than the
            // timeout fails the call while the command keeps running.
            let delay = *self.exec_delay.lock().unwrap();
            if let Some(delay) = delay {
                if delay >= timeout {
                    return Err(EngineError::Timeout {
                        seconds: timeout.as_secs(),
                    });
                }
                tokio::time::sleep(delay).await;
            }
            Ok(ExecOutput {
                stdout: self.exec_stdout.lock().unwrap().clone(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn exec_detached(&self, _id: &str, command: &str) -> EngineResult<()> {
            self.detached.lock().unwrap().push(command.to_string());
            Ok(())
        }

        async fn inspect(&self, id: &str) -> EngineResult<Option<EngineState>> {
            Ok(self.states.lock().unwrap().get(id).map(|status| EngineState {
                status: status.clone(),
                ssh_port: Some(49155),
            }))
        }

        async fn stats(&self, _id: &str) -> EngineResult<EngineStats> {
            Ok(EngineStats {
                cpu_percent: "1.00%".to_string(),
                mem_usage: "100MiB / 2GiB".to_string(),
                mem_percent: "5.00%".to_string(),
            })
        }
    }

    async fn setup() -> (Orchestrator, Arc<FakeEngine>) {
        let db = Database::in_memory().await.unwrap();
        let engine = Arc::new(FakeEngine::default());
        let orch = Orchestrator::new(&db, engine.clone(), "ubuntu:22.04");
        (orch, engine)
    }

    #[tokio::test]
    async fn create_rejects_unauthorized_user() {
        let (orch, _) = setup().await;
        let err = orch.create(42).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotAuthorized(42)));
    }

    #[tokio::test]
    async fn full_lifecycle_scenario() {
        let (orch, _) = setup().await;

        // Allow-list empty: create is refused.
        assert!(matches!(
            orch.create(42).await.unwrap_err(),
            OrchestratorError::NotAuthorized(42)
        ));

        // Admin allows the user on the basic plan.
        orch.allow_user(42, "basic", Some("alice"), Some(1))
            .await
            .unwrap();

        let record = orch.create(42).await.unwrap();
        assert_eq!(record.state, VmState::Running);
        assert_eq!(record.plan_id, "basic");
        assert_eq!(record.ram_limit, "2g");
        assert_eq!(record.cpu_threads, 2);
        assert!(!record.gpu);
        assert_eq!(record.ssh_port, Some(49155));
        assert_eq!(record.ssh_user, "devuser");
        assert_eq!(record.ssh_password.len(), 12);

        orch.stop(42).await.unwrap();
        let status = orch.status(42).await.unwrap();
        assert_eq!(status.record.state, VmState::Stopped);
        assert!(status.stats.is_none());

        // A second create while a record exists is refused.
        assert!(matches!(
            orch.create(42).await.unwrap_err(),
            OrchestratorError::AlreadyExists(42)
        ));

        orch.destroy(42).await.unwrap();
        assert!(matches!(
            orch.status(42).await.unwrap_err(),
            OrchestratorError::NotFound(42)
        ));

        // Destroy is idempotent.
        orch.destroy(42).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_creates_yield_exactly_one_container() {
        let (orch, engine) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move { orch.create(42).await }));
        }

        let mut ok = 0;
        let mut already = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(OrchestratorError::AlreadyExists(42)) => already += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(ok, 1);
        assert_eq!(already, 7);
        assert_eq!(*engine.create_calls.lock().unwrap(), 1);
        // The image was only resolved once despite eight racing creates.
        assert_eq!(*engine.build_calls.lock().unwrap(), 1);
        assert_eq!(orch.list_containers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn maintenance_stops_everything_and_blocks_provisioning() {
        let (orch, _) = setup().await;
        orch.allow_user(1, "basic", None, None).await.unwrap();
        orch.allow_user(2, "basic", None, None).await.unwrap();
        orch.create(1).await.unwrap();
        orch.create(2).await.unwrap();

        let stopped = orch.set_maintenance(true).await.unwrap();
        assert_eq!(stopped, 2);
        for user in [1, 2] {
            let status = orch.status(user).await.unwrap();
            assert_eq!(status.record.state, VmState::Stopped);
        }

        orch.allow_user(3, "basic", None, None).await.unwrap();
        assert!(matches!(
            orch.create(3).await.unwrap_err(),
            OrchestratorError::MaintenanceActive
        ));
        assert!(matches!(
            orch.start(1).await.unwrap_err(),
            OrchestratorError::MaintenanceActive
        ));

        orch.set_maintenance(false).await.unwrap();
        let record = orch.start(1).await.unwrap();
        assert_eq!(record.state, VmState::Running);
    }

    #[tokio::test]
    async fn maintenance_sweep_survives_individual_stop_failures() {
        let (orch, engine) = setup().await;
        orch.allow_user(1, "basic", None, None).await.unwrap();
        orch.allow_user(2, "basic", None, None).await.unwrap();
        orch.create(1).await.unwrap();
        orch.create(2).await.unwrap();

        *engine.fail_stop.lock().unwrap() = true;
        let stopped = orch.set_maintenance(true).await.unwrap();
        assert_eq!(stopped, 0);
        // Both containers were attempted and the flag still went on.
        assert_eq!(*engine.stop_calls.lock().unwrap(), 2);
        assert!(orch.global_settings().await.unwrap().maintenance);
    }

    #[tokio::test]
    async fn status_reconciles_out_of_band_stop() {
        let (orch, engine) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();
        let record = orch.create(42).await.unwrap();
        let engine_id = record.engine_id.unwrap();

        // Someone stops the container behind the control plane's back.
        engine.set_state(&engine_id, "exited");

        let status = orch.status(42).await.unwrap();
        assert_eq!(status.record.state, VmState::Stopped);

        // The correction is persisted, not just returned.
        let again = orch.status(42).await.unwrap();
        assert_eq!(again.record.state, VmState::Stopped);
    }

    #[tokio::test]
    async fn status_drops_record_when_engine_forgot_the_container() {
        let (orch, engine) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();
        let record = orch.create(42).await.unwrap();
        engine.forget(record.engine_id.as_deref().unwrap());

        assert!(matches!(
            orch.status(42).await.unwrap_err(),
            OrchestratorError::NotFound(42)
        ));
        assert!(orch.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_failure_marks_record_failed_and_surfaces_error() {
        let (orch, engine) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();
        *engine.fail_create.lock().unwrap() = Some("daemon down".to_string());

        let err = orch.create(42).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::EngineUnavailable(_)));

        let status = orch.status(42).await.unwrap();
        assert_eq!(status.record.state, VmState::Failed);

        // The failed record still blocks a second create until destroyed.
        *engine.fail_create.lock().unwrap() = None;
        assert!(matches!(
            orch.create(42).await.unwrap_err(),
            OrchestratorError::AlreadyExists(42)
        ));
        orch.destroy(42).await.unwrap();
        assert_eq!(orch.create(42).await.unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn failed_engine_stop_never_updates_the_record() {
        let (orch, engine) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();
        orch.create(42).await.unwrap();

        *engine.fail_stop.lock().unwrap() = true;
        assert!(orch.stop(42).await.is_err());

        *engine.fail_stop.lock().unwrap() = false;
        let status = orch.status(42).await.unwrap();
        assert_eq!(status.record.state, VmState::Running);
    }

    #[tokio::test]
    async fn exec_requires_a_running_container_and_bounds_output() {
        let (orch, engine) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();

        assert!(matches!(
            orch.exec(42, "ls").await.unwrap_err(),
            OrchestratorError::NotFound(42)
        ));

        orch.create(42).await.unwrap();
        *engine.exec_stdout.lock().unwrap() = "hello\n".to_string();
        assert_eq!(orch.exec(42, "echo hello").await.unwrap(), "hello\n");

        *engine.exec_stdout.lock().unwrap() = "x".repeat(10_000);
        let out = orch.exec(42, "yes").await.unwrap();
        assert!(out.len() <= EXEC_OUTPUT_LIMIT + 20);
        assert!(out.ends_with("... (truncated)"));

        orch.stop(42).await.unwrap();
        assert!(matches!(
            orch.exec(42, "ls").await.unwrap_err(),
            OrchestratorError::NotFound(42)
        ));
    }

    #[tokio::test]
    async fn plan_limits_are_snapshotted_at_creation() {
        let (orch, _) = setup().await;
        orch.allow_user(42, "gpu", None, None).await.unwrap();
        // Plan is GPU-eligible but the global GPU switch is off.
        let record = orch.create(42).await.unwrap();
        assert_eq!(record.ram_limit, "8g");
        assert_eq!(record.cpu_threads, 4);
        assert!(!record.gpu);

        // Editing the plan afterwards leaves the snapshot alone.
        orch.plans
            .upsert(&crate::plan::Plan {
                id: "gpu".to_string(),
                ram_limit: "16g".to_string(),
                cpu_threads: 8,
                gpu: true,
            })
            .await
            .unwrap();
        let status = orch.status(42).await.unwrap();
        assert_eq!(status.record.ram_limit, "8g");
    }

    #[tokio::test]
    async fn gpu_passthrough_needs_plan_and_global_switch() {
        let (orch, _) = setup().await;
        orch.set_default_gpu(true).await.unwrap();
        orch.allow_user(42, "gpu", None, None).await.unwrap();
        let record = orch.create(42).await.unwrap();
        assert!(record.gpu);
    }

    #[tokio::test]
    async fn allow_user_validates_plan_and_removal_reports_leftovers() {
        let (orch, _) = setup().await;
        assert!(orch.allow_user(42, "nope", None, None).await.is_err());

        orch.allow_user(42, "basic", None, None).await.unwrap();
        orch.create(42).await.unwrap();

        let leftover = orch.remove_user(42).await.unwrap();
        assert_eq!(leftover.as_deref(), Some("devbox-user-42"));
        // Container untouched by allow-list removal.
        assert_eq!(orch.list_containers().await.unwrap().len(), 1);
        // But the user can no longer create a new one after destroying.
        orch.destroy(42).await.unwrap();
        assert!(matches!(
            orch.create(42).await.unwrap_err(),
            OrchestratorError::NotAuthorized(42)
        ));
    }

    #[tokio::test]
    async fn destroy_all_sweeps_every_record() {
        let (orch, _) = setup().await;
        for user in [1, 2, 3] {
            orch.allow_user(user, "basic", None, None).await.unwrap();
            orch.create(user).await.unwrap();
        }
        assert_eq!(orch.destroy_all().await.unwrap(), 3);
        assert!(orch.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn web_terminal_requires_running_container() {
        let (orch, engine) = setup().await;
        let orch = orch.clone().with_tunnels(TunnelManager::with_timing(
            engine.clone(),
            Duration::from_millis(100),
            Duration::from_millis(10),
        ));
        orch.allow_user(42, "basic", None, None).await.unwrap();
        orch.create(42).await.unwrap();
        orch.stop(42).await.unwrap();

        let err = orch.web_terminal(42).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ContainerNotRunning(42)));
    }

    #[tokio::test]
    async fn stop_and_destroy_tear_down_the_tunnel_session() {
        let (orch, engine) = setup().await;
        let orch = orch.clone().with_tunnels(TunnelManager::with_timing(
            engine.clone(),
            Duration::from_millis(200),
            Duration::from_millis(10),
        ));
        orch.allow_user(42, "basic", None, None).await.unwrap();
        orch.create(42).await.unwrap();

        *engine.exec_stdout.lock().unwrap() =
            "INF https://shiny-fox.trycloudflare.com".to_string();
        let session = orch.web_terminal(42).await.unwrap();
        assert_eq!(session.url, "https://shiny-fox.trycloudflare.com");
        assert!(orch.tunnels.active(42).is_some());

        orch.stop(42).await.unwrap();
        assert!(orch.tunnels.active(42).is_none());
        let kills = engine
            .detached
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("pkill"))
            .count();
        // One pair from the supersede on open, one from the stop.
        assert!(kills >= 4);

        orch.start(42).await.unwrap();
        orch.web_terminal(42).await.unwrap();
        assert!(orch.tunnels.active(42).is_some());

        orch.destroy(42).await.unwrap();
        assert!(orch.tunnels.active(42).is_none());
        assert!(
            engine
                .detached
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("pkill ttyd"))
        );
    }

    #[tokio::test]
    async fn timed_out_exec_fails_fast_and_leaves_the_container_running() {
        let (orch, engine) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();
        orch.create(42).await.unwrap();

        *engine.exec_delay.lock().unwrap() = Some(Duration::from_secs(3600));
        let err = orch.exec(42, "sleep 3600").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { seconds: 60, .. }));

        // Only the control-plane call gave up; the container is untouched.
        *engine.exec_delay.lock().unwrap() = None;
        let status = orch.status(42).await.unwrap();
        assert_eq!(status.record.state, VmState::Running);
        assert_eq!(orch.exec(42, "echo ok").await.unwrap(), "");
    }

    #[tokio::test]
    async fn status_racing_a_stop_settles_on_stopped() {
        let (orch, _) = setup().await;
        orch.allow_user(42, "basic", None, None).await.unwrap();
        orch.create(42).await.unwrap();

        let stopper = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.stop(42).await })
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let orch = orch.clone();
            readers.push(tokio::spawn(async move { orch.status(42).await }));
        }

        stopper.await.unwrap().unwrap();
        for reader in readers {
            reader.await.unwrap().unwrap();
        }

        // Reconciliation writes are serialized with the stop, so once it
        // has completed the record stays stopped.
        let status = orch.status(42).await.unwrap();
        assert_eq!(status.record.state, VmState::Stopped);
    }
}
