//! The per-agent HTTP server.
//!
//! One process per agent, bound to loopback, fronting that agent's session
//! cache, memory store, subagent pool, and cron service. Launched by the
//! supervisor with `--id --port --data-dir --provider --model`; the API key
//! arrives on stdin (one line, within 1s) or falls back to the provider's
//! environment variable, which is then scrubbed from the process.
//!
//! `server.pid` exists exactly while the server runs: it is written after a
//! successful bind and removed on every exit path by a drop guard.

mod routes;

pub use routes::{ChatRequest, ChatResponse, ServerState, SharedState, harden_session_id, router};

use std::{
    fs,
    io::IsTerminal,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::Notify,
};
use zeroize::Zeroizing;

use crate::{
    config::consume_env_key,
    error::{Error, Result},
    llm::{AuthStore, SessionFactory, runtime::ChatRuntime},
    orchestrator::{DEFAULT_FLUSH_THRESHOLD, Orchestrator, OrchestratorConfig},
};

/// How long to wait for the API key on stdin before falling back to the
/// environment.
const STDIN_KEY_TIMEOUT: Duration = Duration::from_secs(1);

// ─── Arguments ───────────────────────────────────────────────────────────────

/// CLI arguments of the `tinycrab-server` binary (supplied by the supervisor).
#[derive(Debug, Parser)]
#[command(name = "tinycrab-server", about = "tinycrab per-agent server")]
pub struct AgentServerArgs {
    /// Agent identifier; also the directory name under `<data>/agents/`.
    #[arg(long)]
    pub id: String,

    /// Loopback port to bind.
    #[arg(long)]
    pub port: u16,

    /// Supervisor data directory.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// LLM provider id.
    #[arg(long, default_value = "openai")]
    pub provider: String,

    /// Model identifier.
    #[arg(long, default_value = "gpt-4o")]
    pub model: String,
}

// ─── Entry point ─────────────────────────────────────────────────────────────

/// Run the agent server until a termination signal or `POST /stop`.
pub async fn run(args: AgentServerArgs) -> Result<()> {
    let auth_store = read_auth(&args.provider).await;
    let factory: Arc<dyn SessionFactory> = Arc::new(ChatRuntime::new());
    run_with_factory(args, auth_store, factory).await
}

/// [`run`] with an injected session factory (tests use scripted sessions).
pub async fn run_with_factory(
    args: AgentServerArgs,
    auth_store: AuthStore,
    factory: Arc<dyn SessionFactory>,
) -> Result<()> {
    let agent_dir = args.data_dir.join("agents").join(&args.id);
    let workspace = agent_dir.join("workspace");
    let sessions_dir = agent_dir.join("sessions");
    let memory_dir = agent_dir.join("memory");
    fs::create_dir_all(&workspace)?;
    fs::create_dir_all(&sessions_dir)?;
    fs::create_dir_all(&memory_dir)?;

    let orchestrator = Orchestrator::build(
        OrchestratorConfig {
            agent_id: args.id.clone(),
            model: args.model.clone(),
            provider: args.provider.clone(),
            workspace: workspace.clone(),
            sessions_dir: sessions_dir.clone(),
            memory_dir: memory_dir.clone(),
            cron_store_path: agent_dir.join("cron.json"),
            auth_store,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        },
        factory,
    )?;
    orchestrator.start().await?;
    let dispatch = tokio::spawn(Arc::clone(&orchestrator).run());

    let stop = Arc::new(Notify::new());
    let state: SharedState = Arc::new(ServerState {
        agent_id: args.id.clone(),
        port: args.port,
        workspace,
        sessions_dir,
        memory_dir,
        orchestrator: Arc::clone(&orchestrator),
        stop: Arc::clone(&stop),
    });

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let addr = listener.local_addr()?;
    let _pid_guard = PidFile::write(&agent_dir)?;
    log::info!("[server] agent '{}' listening on {addr}", args.id);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(stop))
        .await
        .map_err(|e| Error::runtime(format!("server error: {e}")))?;

    orchestrator.close().await;
    dispatch.abort();
    log::info!("[server] agent '{}' shut down", args.id);
    Ok(())
}

/// Resolves when a termination signal arrives or `/stop` fires.
async fn shutdown_signal(stop: Arc<Notify>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("[server] interrupt received"),
        () = terminate => log::info!("[server] terminate received"),
        () = stop.notified() => {}
    }
}

// ─── API-key handoff ─────────────────────────────────────────────────────────

/// Read the API key per the startup protocol: one newline-terminated line on
/// stdin within 1s, else the provider's environment variable (which is then
/// deleted from the process).
async fn read_auth(provider: &str) -> AuthStore {
    let mut store = AuthStore::new();
    if let Some(key) = read_stdin_key().await {
        store.insert(provider, key);
        return store;
    }
    if let Some(key) = consume_env_key(provider) {
        store.insert(provider, key);
        return store;
    }
    log::warn!("[server] no API key via stdin or environment for provider '{provider}'");
    store
}

async fn read_stdin_key() -> Option<Zeroizing<String>> {
    // An interactive stdin means nobody is piping a key in.
    if std::io::stdin().is_terminal() {
        return None;
    }
    let mut line = String::new();
    let read = tokio::time::timeout(
        STDIN_KEY_TIMEOUT,
        BufReader::new(tokio::io::stdin()).read_line(&mut line),
    )
    .await;
    match read {
        Ok(Ok(n)) if n > 0 && !line.trim().is_empty() => {
            Some(Zeroizing::new(line.trim().to_owned()))
        }
        _ => None,
    }
}

// ─── Pid file ────────────────────────────────────────────────────────────────

/// Writes `server.pid` on creation and removes it on drop, so the file
/// exists exactly while the server process is serving.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn write(agent_dir: &Path) -> Result<Self> {
        let path = agent_dir.join("server.pid");
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("[server] failed to remove pid file: {e}");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
