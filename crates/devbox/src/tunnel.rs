//! Web terminal tunnel sessions.
//!
//! A session pairs a terminal multiplexer (`ttyd`) with a reverse tunnel
//! (`cloudflared`) running inside the user's container, exposing a shell
//! over HTTPS without opening inbound ports. At most one session exists per
//! container; reopening supersedes the previous one.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::engine::EngineApi;
use crate::vm::{ContainerRecord, OrchestratorError, OrchestratorResult, VmState};

/// Port ttyd listens on inside the container.
const TTYD_PORT: u16 = 7681;
/// Where the tunnel process writes its log inside the container.
const TUNNEL_LOG: &str = "/tmp/cloudflared.log";
/// How long a session stays valid before a reopen is forced.
const SESSION_TTL_HOURS: i64 = 12;

/// Public URL assigned by the tunnel, as it appears in its log.
static TUNNEL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[\w.-]+\.trycloudflare\.com").expect("valid pattern"));

/// An active tunnel session.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TunnelSession {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Supervises tunnel sessions, one per container at most.
///
/// Sessions are in-memory only: they own processes inside the container,
/// which do not survive a control-plane restart anyway.
#[derive(Clone)]
pub struct TunnelManager {
    engine: Arc<dyn EngineApi>,
    sessions: Arc<Mutex<HashMap<i64, TunnelSession>>>,
    url_wait: Duration,
    poll_interval: Duration,
}

impl TunnelManager {
    pub fn new(engine: Arc<dyn EngineApi>) -> Self {
        Self::with_timing(engine, Duration::from_secs(60), Duration::from_secs(1))
    }

    /// Override the URL wait ceiling and poll interval (used by tests).
    pub fn with_timing(
        engine: Arc<dyn EngineApi>,
        url_wait: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            url_wait,
            poll_interval,
        }
    }

    /// The current session for a user, if one is active and unexpired.
    pub fn active(&self, user_id: i64) -> Option<TunnelSession> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&user_id) {
            Some(s) if !s.is_expired() => Some(s.clone()),
            Some(_) => {
                sessions.remove(&user_id);
                None
            }
            None => None,
        }
    }

    /// Open a tunnel session for a running container.
    ///
    /// Any existing session for the container is closed first, so two live
    /// tunnels never point at the same container.
    pub async fn open(&self, record: &ContainerRecord) -> OrchestratorResult<TunnelSession> {
        if record.state != VmState::Running {
            return Err(OrchestratorError::ContainerNotRunning(record.user_id));
        }
        let engine_id = record
            .engine_id
            .as_deref()
            .ok_or(OrchestratorError::ContainerNotRunning(record.user_id))?;

        // Supersede: tear down the previous session and any stray processes.
        self.close(record.user_id, Some(engine_id)).await;

        // Start ttyd unless it is already listening.
        let ttyd_check = self
            .engine
            .exec(engine_id, "pgrep ttyd", Duration::from_secs(10))
            .await?;
        if ttyd_check.exit_code != 0 {
            self.engine
                .exec_detached(
                    engine_id,
                    &format!("ttyd -p {TTYD_PORT} -W bash > /tmp/ttyd.log 2>&1"),
                )
                .await?;
        }

        // Fresh log so a stale URL from an earlier tunnel can't be scraped.
        self.engine
            .exec_detached(engine_id, &format!("rm -f {TUNNEL_LOG}"))
            .await?;
        self.engine
            .exec_detached(
                engine_id,
                &format!(
                    "cloudflared tunnel --url http://localhost:{TTYD_PORT} > {TUNNEL_LOG} 2>&1"
                ),
            )
            .await?;

        match self.wait_for_url(engine_id).await {
            Ok(url) => {
                let now = Utc::now();
                let session = TunnelSession {
                    url,
                    created_at: now,
                    expires_at: now + chrono::Duration::hours(SESSION_TTL_HOURS),
                };
                self.sessions
                    .lock()
                    .unwrap()
                    .insert(record.user_id, session.clone());
                Ok(session)
            }
            Err(err) => {
                // Error path still releases both processes.
                self.close(record.user_id, Some(engine_id)).await;
                Err(err)
            }
        }
    }

    /// Close the session for a user, killing tunnel then multiplexer.
    ///
    /// Idempotent: closing an absent session, or one whose container is
    /// already gone, is a no-op.
    pub async fn close(&self, user_id: i64, engine_id: Option<&str>) {
        self.sessions.lock().unwrap().remove(&user_id);

        let Some(engine_id) = engine_id else {
            return;
        };
        for cmd in ["pkill -f cloudflared", "pkill ttyd"] {
            if let Err(err) = self.engine.exec_detached(engine_id, cmd).await {
                debug!(user_id, %err, "tunnel teardown command failed");
            }
        }
    }

    /// Poll the tunnel log for the assigned public URL, bounded by
    /// `url_wait`.
    async fn wait_for_url(&self, engine_id: &str) -> OrchestratorResult<String> {
        let deadline = tokio::time::Instant::now() + self.url_wait;

        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self
                .engine
                .exec(engine_id, &format!("cat {TUNNEL_LOG}"), Duration::from_secs(10))
                .await
            {
                Ok(output) => {
                    if let Some(m) = TUNNEL_URL_RE.find(&output.combined()) {
                        return Ok(m.as_str().to_string());
                    }
                }
                Err(err) => warn!(%err, "reading tunnel log failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::TunnelTimeout(self.url_wait.as_secs()));
            }
        }
    }
}
