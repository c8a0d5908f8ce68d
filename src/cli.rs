//! tinycrab CLI — headless interface to the agent supervisor.
//!
//! Subcommands manage agent processes through the supervisor's in-process
//! API (`spawn`, `chat`, `agents`, `stop`, `destroy`) or run a single agent
//! in-process with a line-based REPL (`serve`). Exit code is 0 on success
//! and 1 on any operation that reports a failure to stderr.

use std::{
    io::{BufRead, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use clap::{Parser, Subcommand};

use tinycrab::{
    bus::{InboundMessage, OutboundMessage},
    config::{TinycrabOptions, consume_env_key},
    llm::{AuthStore, runtime::ChatRuntime},
    orchestrator::{DEFAULT_FLUSH_THRESHOLD, Orchestrator, OrchestratorConfig},
    supervisor::{AgentStatus, SpawnOptions, Supervisor},
};

// ---------------------------------------------------------------------------
// Top-level CLI struct
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tinycrab",
    about = "Supervisor for long-running conversational agent processes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Supervisor data directory (default ./.tinycrab, or $AGENT_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// LLM provider id (default openai, or $AGENT_PROVIDER).
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model identifier (default gpt-4o, or $AGENT_MODEL).
    #[arg(long, global = true)]
    model: Option<String>,
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an agent process (or return the one already running).
    Spawn {
        /// Agent identifier.
        id: String,
    },
    /// Send a chat turn to an agent, spawning it if needed.
    Chat {
        id: String,
        message: String,
        /// Continue an existing session by id.
        #[arg(long)]
        session: Option<String>,
    },
    /// List agents and their status.
    Agents,
    /// Stop a running agent process.
    Stop { id: String },
    /// Stop an agent and delete its data directory.
    Destroy {
        id: String,
        /// Keep the agent's directory on disk.
        #[arg(long)]
        keep_data: bool,
    },
    /// Run one agent in-process with a line-based REPL (no subprocess).
    Serve {
        /// Agent identifier.
        #[arg(default_value = "main")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tinycrab::logging::init();
    let cli = Cli::parse();

    let mut options = TinycrabOptions::from_env();
    if let Some(data_dir) = cli.data_dir {
        options.data_dir = data_dir;
    }
    if let Some(provider) = cli.provider {
        options.provider = provider;
    }
    if let Some(model) = cli.model {
        options.model = model;
    }

    let result = match cli.command {
        Commands::Spawn { id } => cmd_spawn(options, &id).await,
        Commands::Chat {
            id,
            message,
            session,
        } => cmd_chat(options, &id, &message, session.as_deref()).await,
        Commands::Agents => cmd_agents(options).await,
        Commands::Stop { id } => cmd_stop(options, &id).await,
        Commands::Destroy { id, keep_data } => cmd_destroy(options, &id, !keep_data).await,
        Commands::Serve { id } => cmd_serve(options, &id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_err(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn print_err(message: &str) {
    eprintln!("tinycrab: {message}");
}

// ---------------------------------------------------------------------------
// Supervisor-backed commands
// ---------------------------------------------------------------------------

async fn supervisor(options: TinycrabOptions) -> tinycrab::error::Result<Arc<Supervisor>> {
    let supervisor = Supervisor::new(options);
    supervisor.init().await?;
    Ok(supervisor)
}

async fn cmd_spawn(options: TinycrabOptions, id: &str) -> tinycrab::error::Result<()> {
    let supervisor = supervisor(options).await?;
    let handle = supervisor.spawn(id, Some(SpawnOptions::default())).await?;
    println!("agent '{}' running on port {}", handle.id, handle.port);
    Ok(())
}

async fn cmd_chat(
    options: TinycrabOptions,
    id: &str,
    message: &str,
    session: Option<&str>,
) -> tinycrab::error::Result<()> {
    let supervisor = supervisor(options).await?;
    let handle = supervisor.spawn(id, None).await?;
    let reply = handle.chat(message, session).await?;
    println!("{}", reply.response);
    eprintln!("(session: {})", reply.session_id);
    Ok(())
}

async fn cmd_agents(options: TinycrabOptions) -> tinycrab::error::Result<()> {
    let supervisor = supervisor(options).await?;
    let agents = supervisor.list().await;
    if agents.is_empty() {
        println!("no agents");
        return Ok(());
    }
    println!("{:<20} {:<10} {:<8} PID", "ID", "STATUS", "PORT");
    for agent in agents {
        println!(
            "{:<20} {:<10} {:<8} {}",
            agent.id,
            match agent.status {
                AgentStatus::Running => "running",
                AgentStatus::Stopped => "stopped",
            },
            agent
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_owned()),
            agent
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_owned()),
        );
    }
    Ok(())
}

async fn cmd_stop(options: TinycrabOptions, id: &str) -> tinycrab::error::Result<()> {
    let supervisor = supervisor(options).await?;
    match supervisor.get(id).await {
        Some(handle) => {
            handle.stop().await?;
            println!("agent '{id}' stopped");
            Ok(())
        }
        None => Err(tinycrab::error::Error::not_found(format!("agent {id}"))),
    }
}

async fn cmd_destroy(
    options: TinycrabOptions,
    id: &str,
    cleanup: bool,
) -> tinycrab::error::Result<()> {
    let supervisor = supervisor(options).await?;
    match supervisor.get(id).await {
        Some(handle) => {
            handle.destroy(cleanup).await?;
            println!("agent '{id}' destroyed");
            Ok(())
        }
        None => Err(tinycrab::error::Error::not_found(format!("agent {id}"))),
    }
}

// ---------------------------------------------------------------------------
// In-process serve mode
// ---------------------------------------------------------------------------

async fn cmd_serve(options: TinycrabOptions, id: &str) -> tinycrab::error::Result<()> {
    let agent_dir = options.data_dir.join("agents").join(id);
    let mut auth_store = AuthStore::new();
    if let Some(key) = consume_env_key(&options.provider) {
        auth_store.insert(options.provider.clone(), key);
    }

    let workspace = std::env::var("AGENT_WORKSPACE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| agent_dir.join("workspace"));

    let orchestrator = Orchestrator::build(
        OrchestratorConfig {
            agent_id: id.to_owned(),
            model: options.model.clone(),
            provider: options.provider.clone(),
            workspace,
            sessions_dir: agent_dir.join("sessions"),
            memory_dir: agent_dir.join("memory"),
            cron_store_path: options.data_dir.join("cron.json"),
            auth_store,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        },
        Arc::new(ChatRuntime::new()),
    )?;
    orchestrator.start().await?;

    // Replies and subagent announcements for the CLI channel print to stdout.
    orchestrator.bus().subscribe(
        "cli",
        Arc::new(|message: &OutboundMessage| {
            println!("{}", message.text);
            let _ = std::io::stdout().flush();
        }),
    );
    let dispatch = tokio::spawn(Arc::clone(&orchestrator).run());

    eprintln!("tinycrab serve: agent '{id}' ready (ctrl-d to exit)");
    let bus = Arc::clone(orchestrator.bus());
    let reader = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim().to_owned();
            if line.is_empty() {
                continue;
            }
            bus.publish_inbound(InboundMessage::new("cli", "default", line));
        }
    });

    tokio::select! {
        _ = reader => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    orchestrator.close().await;
    let _ = dispatch.await;
    Ok(())
}
