//! The supervisor: spawns, addresses, and tears down agent processes.
//!
//! Each agent is a `tinycrab-server` subprocess bound to a loopback port.
//! The supervisor owns the mapping from agent id to process, allocates ports
//! through a serial chain, hands the API key to the child over stdin (never
//! argv, never inherited environment), and reconciles its in-memory view
//! with `<data>/agents/*/meta.json` + `server.pid` on startup — so agents
//! keep running across supervisor restarts and are re-adopted by the next
//! supervisor pointing at the same data directory.

mod handle;

pub use handle::{AgentHandle, ChatReply};

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::{
    config::{RunMode, TinycrabOptions, key_env_var},
    error::{Error, Result},
};

/// Per-probe cap on `/health`.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Readiness polling after spawn: attempts × interval ≈ 6s.
const READY_POLL_ATTEMPTS: u32 = 30;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period between `POST /stop` and dropping handles in [`Supervisor::close`].
const CLOSE_GRACE: Duration = Duration::from_millis(200);

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Stopped,
}

/// Contents of `<agent>/meta.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentMeta {
    created_at: i64,
    port: u16,
}

/// A snapshot of one agent's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub status: AgentStatus,
    pub workspace: PathBuf,
    pub sessions_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

struct AgentSlot {
    meta: AgentMeta,
    status: AgentStatus,
    pid: Option<u32>,
    child: Option<tokio::process::Child>,
}

/// Overrides for a single [`Supervisor::spawn`] call.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub model: Option<String>,
    pub provider: Option<String>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct Supervisor {
    options: TinycrabOptions,
    client: reqwest::Client,
    agents: tokio::sync::Mutex<HashMap<String, AgentSlot>>,
    /// Serial port allocator: each allocation awaits the previous one.
    next_port: tokio::sync::Mutex<u16>,
}

impl Supervisor {
    pub fn new(options: TinycrabOptions) -> Arc<Self> {
        let base_port = options.base_port;
        Arc::new(Self {
            options,
            client: reqwest::Client::new(),
            agents: tokio::sync::Mutex::new(HashMap::new()),
            next_port: tokio::sync::Mutex::new(base_port),
        })
    }

    fn agents_root(&self) -> PathBuf {
        self.options.data_dir.join("agents")
    }

    fn agent_dir(&self, id: &str) -> PathBuf {
        self.agents_root().join(id)
    }

    /// Create the data layout and reconcile with whatever is on disk: an
    /// agent whose recorded pid is alive and whose `/health` answers is
    /// adopted as running; anything else is marked stopped and its stale
    /// `server.pid` erased.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.agents_root())?;
        let mut highest_port = self.options.base_port;
        let mut agents = self.agents.lock().await;

        for dir_entry in fs::read_dir(self.agents_root())? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let id = dir_entry.file_name().to_string_lossy().into_owned();
            let meta_path = dir_entry.path().join("meta.json");
            let meta: AgentMeta = match fs::read_to_string(&meta_path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
            {
                Some(meta) => meta,
                None => {
                    log::warn!("[supervisor] skipping '{id}': unreadable meta.json");
                    continue;
                }
            };
            highest_port = highest_port.max(meta.port.saturating_add(1));

            let pid_path = dir_entry.path().join("server.pid");
            let pid = fs::read_to_string(&pid_path)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            let alive = match pid {
                Some(pid) => {
                    process_alive(pid) && self.health_ok(meta.port).await
                }
                None => false,
            };
            if !alive && pid_path.exists() {
                let _ = fs::remove_file(&pid_path);
            }
            let status = if alive {
                AgentStatus::Running
            } else {
                AgentStatus::Stopped
            };
            log::info!(
                "[supervisor] reconciled agent '{id}' on port {} as {status:?}",
                meta.port
            );
            agents.insert(
                id,
                AgentSlot {
                    meta,
                    status,
                    pid: if alive { pid } else { None },
                    child: None,
                },
            );
        }

        let mut next_port = self.next_port.lock().await;
        *next_port = (*next_port).max(highest_port);
        Ok(())
    }

    /// Get or start the agent `id`. Spawning an already-running agent
    /// returns the existing handle without allocating a port or a process.
    pub async fn spawn(
        self: &Arc<Self>,
        id: &str,
        opts: Option<SpawnOptions>,
    ) -> Result<AgentHandle> {
        if self.options.mode != RunMode::Local {
            return Err(Error::validation(
                "only local mode is supported for spawning agents",
            ));
        }
        let id = sanitize_id(id);
        if id.is_empty() {
            return Err(Error::validation("agent id must not be empty"));
        }

        // Fast path: already running and healthy.
        {
            let agents = self.agents.lock().await;
            if let Some(slot) = agents.get(&id)
                && slot.status == AgentStatus::Running
                && self.health_ok(slot.meta.port).await
            {
                return Ok(self.handle(&id, slot.meta.port));
            }
        }

        let agent_dir = self.agent_dir(&id);
        fs::create_dir_all(agent_dir.join("workspace"))?;
        fs::create_dir_all(agent_dir.join("sessions"))?;
        fs::create_dir_all(agent_dir.join("memory"))?;

        // Reuse a previously recorded port when possible.
        let recorded = {
            let agents = self.agents.lock().await;
            agents.get(&id).map(|slot| slot.meta)
        };
        let port = match recorded {
            // A recorded port is reused unless something else answers on it.
            Some(meta) => {
                if self.health_ok(meta.port).await {
                    self.allocate_port().await?
                } else {
                    meta.port
                }
            }
            None => self.allocate_port().await?,
        };

        let opts = opts.unwrap_or_default();
        let provider = opts.provider.unwrap_or_else(|| self.options.provider.clone());
        let model = opts.model.unwrap_or_else(|| self.options.model.clone());
        let child = self.launch(&id, port, &provider, &model).await?;
        let pid = child.id();

        let created_at = recorded
            .map(|meta| meta.created_at)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let meta = AgentMeta { created_at, port };
        fs::write(
            agent_dir.join("meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;

        let mut agents = self.agents.lock().await;
        agents.insert(
            id.clone(),
            AgentSlot {
                meta,
                status: AgentStatus::Running,
                pid,
                child: Some(child),
            },
        );
        log::info!("[supervisor] agent '{id}' up on port {port} (pid {pid:?})");
        Ok(self.handle(&id, port))
    }

    /// Start the server subprocess and wait for `/health`.
    async fn launch(
        &self,
        id: &str,
        port: u16,
        provider: &str,
        model: &str,
    ) -> Result<tokio::process::Child> {
        let program = self.options.resolve_server_program();
        let mut child = tokio::process::Command::new(&program)
            .arg("--id")
            .arg(id)
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(&self.options.data_dir)
            .arg("--provider")
            .arg(provider)
            .arg("--model")
            .arg(model)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::runtime(format!(
                    "failed to launch {}: {e}",
                    program.display()
                ))
            })?;

        // Secret handoff: one line on the child's stdin, then close it. The
        // key never appears on the command line or in inherited environment.
        if let Some(mut stdin) = child.stdin.take() {
            if let Some(key) = self.api_key(provider) {
                let _ = stdin.write_all(format!("{key}\n").as_bytes()).await;
            }
            let _ = stdin.shutdown().await;
            drop(stdin);
        }

        for _ in 0..READY_POLL_ATTEMPTS {
            if self.health_ok(port).await {
                return Ok(child);
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        let _ = child.kill().await;
        Err(Error::Timeout(format!(
            "agent '{id}' did not become healthy on port {port}"
        )))
    }

    fn api_key(&self, provider: &str) -> Option<String> {
        if let Some(ref key) = self.options.api_key {
            return Some(key.clone());
        }
        key_env_var(provider).and_then(|var| std::env::var(var).ok())
    }

    /// Handle for an agent the supervisor already knows about.
    pub async fn get(self: &Arc<Self>, id: &str) -> Option<AgentHandle> {
        let agents = self.agents.lock().await;
        agents.get(id).map(|slot| self.handle(id, slot.meta.port))
    }

    /// Snapshot every agent, refreshing status via `/health`.
    pub async fn list(&self) -> Vec<AgentInfo> {
        let mut agents = self.agents.lock().await;
        let mut infos = Vec::with_capacity(agents.len());
        for (id, slot) in agents.iter_mut() {
            let healthy = self.health_ok(slot.meta.port).await;
            if !healthy {
                slot.status = AgentStatus::Stopped;
                slot.pid = None;
            } else {
                slot.status = AgentStatus::Running;
            }
            let agent_dir = self.options.data_dir.join("agents").join(id);
            infos.push(AgentInfo {
                id: id.clone(),
                status: slot.status,
                workspace: agent_dir.join("workspace"),
                sessions_dir: agent_dir.join("sessions"),
                memory_dir: agent_dir.join("memory"),
                created_at: slot.meta.created_at,
                port: (slot.status == AgentStatus::Running).then_some(slot.meta.port),
                pid: slot.pid,
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Ask every running agent to stop, wait briefly, then discard handles.
    pub async fn close(&self) {
        let targets: Vec<u16> = {
            let agents = self.agents.lock().await;
            agents
                .values()
                .filter(|slot| slot.status == AgentStatus::Running)
                .map(|slot| slot.meta.port)
                .collect()
        };
        for port in targets {
            let _ = self
                .client
                .post(format!("http://127.0.0.1:{port}/stop"))
                .timeout(HEALTH_PROBE_TIMEOUT)
                .send()
                .await;
        }
        tokio::time::sleep(CLOSE_GRACE).await;
        self.agents.lock().await.clear();
    }

    /// Forget an agent; with `cleanup`, delete its directory as well.
    pub(crate) async fn forget(&self, id: &str, cleanup: bool) -> Result<()> {
        self.agents.lock().await.remove(id);
        if cleanup {
            let dir = self.agent_dir(id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn recorded_pid(&self, id: &str) -> Option<u32> {
        let agents = self.agents.lock().await;
        agents.get(id).and_then(|slot| slot.pid)
    }

    /// Mark an agent stopped (after its handle stopped it).
    pub(crate) async fn mark_stopped(&self, id: &str) {
        let mut agents = self.agents.lock().await;
        if let Some(slot) = agents.get_mut(id) {
            slot.status = AgentStatus::Stopped;
            slot.pid = None;
            slot.child = None;
        }
    }

    /// Allocate the next free port. Serialized so concurrent spawns never
    /// race to the same port.
    async fn allocate_port(&self) -> Result<u16> {
        let mut next = self.next_port.lock().await;
        for _ in 0..512 {
            let candidate = *next;
            *next = next.checked_add(1).ok_or_else(|| {
                Error::runtime("port allocator exhausted the u16 range")
            })?;
            if !self.health_ok(candidate).await {
                return Ok(candidate);
            }
            log::debug!("[supervisor] port {candidate} already serving; skipping");
        }
        Err(Error::runtime("no free port found"))
    }

    async fn health_ok(&self, port: u16) -> bool {
        let request = self
            .client
            .get(format!("http://127.0.0.1:{port}/health"))
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await;
        matches!(request, Ok(response) if response.status().is_success())
    }

    fn handle(self: &Arc<Self>, id: &str, port: u16) -> AgentHandle {
        AgentHandle::new(Arc::clone(self), id.to_owned(), port, self.client.clone())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Lowercase, `[a-z0-9_-]` only; anything else becomes `-`.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Signal-0 liveness probe.
fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
