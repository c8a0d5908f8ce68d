//! The in-process orchestrator.
//!
//! Assembles one agent's subsystems — message bus, session cache, memory,
//! subagent pool, cron service, tool registry — and runs the dispatch loop
//! that turns inbound bus messages into LLM turns. Cron payloads route
//! through here as well: system events are republished on the inbound bus
//! (channel `"cron"`, chat id = job id) and agent turns run in the job's own
//! session.
//!
//! Construction order matters: the cron executor captures the session
//! manager through a cell filled at the end of `build`, because the session
//! manager's tool list includes the cron tools.

use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use crate::{
    bus::{InboundMessage, MessageBus, OutboundMessage},
    cron::{CronJob, CronService, JobExecutor, Payload},
    error::{Error, Result},
    llm::{AuthStore, SessionFactory},
    memory::{
        MemoryStore,
        tools::{RecallTool, RememberTool},
    },
    session::{SessionKey, SessionManager, SessionTemplate},
    subagent::{SpawnRequest, SubagentManager},
    tools::{
        ToolRegistry,
        cron::{CronCancelTool, CronListTool, CronScheduleTool},
        subagents::{ListSubagentsTool, SpawnSubagentTool, StopSubagentTool},
    },
};

/// Context fill ratio that triggers the pre-compaction memory flush.
pub const DEFAULT_FLUSH_THRESHOLD: f64 = 0.80;

/// Silent turn issued before a user turn when the context is nearly full.
const FLUSH_PROMPT: &str = "Your context window is nearly full. Call the `remember` tool now for \
     anything from this conversation worth preserving long-term. If nothing \
     is worth preserving, reply with exactly NO_REPLY.";

// ─── OrchestratorConfig ──────────────────────────────────────────────────────

/// Everything needed to assemble one agent's subsystems.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub agent_id: String,
    pub model: String,
    pub provider: String,
    pub workspace: PathBuf,
    pub sessions_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub cron_store_path: PathBuf,
    pub auth_store: AuthStore,
    pub flush_threshold: f64,
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// One agent's glued-together subsystems and dispatch loop.
pub struct Orchestrator {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionManager>,
    subagents: Arc<SubagentManager>,
    cron: Arc<CronService>,
    memory: Arc<MemoryStore>,
    flush_threshold: f64,
}

impl Orchestrator {
    /// Assemble the subsystems. Call [`Orchestrator::start`] afterwards to
    /// load cron jobs and begin background sweeps.
    pub fn build(
        config: OrchestratorConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.workspace)?;
        std::fs::create_dir_all(&config.sessions_dir)?;

        let bus = Arc::new(MessageBus::new());
        let memory = Arc::new(MemoryStore::open(&config.memory_dir)?);

        // Cron's executor needs the session manager, which needs the tool
        // list, which needs the cron service. The cell breaks the cycle.
        let sessions_cell: Arc<OnceLock<Arc<SessionManager>>> = Arc::new(OnceLock::new());
        let cron = CronService::new(
            config.cron_store_path.clone(),
            cron_executor(Arc::clone(&bus), Arc::clone(&sessions_cell)),
        );

        // Phase one: tools that do not involve the subagent manager.
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(RememberTool::new(Arc::clone(&memory))));
        registry.register(Arc::new(RecallTool::new(Arc::clone(&memory))));
        registry.register(Arc::new(CronScheduleTool::new(Arc::clone(&cron))));
        registry.register(Arc::new(CronListTool::new(Arc::clone(&cron))));
        registry.register(Arc::new(CronCancelTool::new(Arc::clone(&cron))));

        // Subagents see the registry minus the denied set; the subagent
        // tools themselves are part of that set, so this template is final.
        let subagent_template = SessionTemplate {
            model: config.model.clone(),
            provider: config.provider.clone(),
            tools: Vec::new(),
            custom_tools: registry.for_subagent(),
            workspace_path: config.workspace.clone(),
            sessions_dir: config.sessions_dir.clone(),
            auth_store: config.auth_store.clone(),
        };
        let subagents = SubagentManager::new(
            Arc::clone(&factory),
            subagent_template,
            Arc::clone(&bus),
            config.agent_id.clone(),
        );

        // Phase two: subagent management tools for the main agent.
        registry.register(Arc::new(SpawnSubagentTool::new(
            Arc::clone(&subagents),
            false,
        )));
        registry.register(Arc::new(StopSubagentTool::new(
            Arc::clone(&subagents),
            false,
        )));
        registry.register(Arc::new(ListSubagentsTool::new(
            Arc::clone(&subagents),
            false,
        )));

        let template = SessionTemplate {
            model: config.model.clone(),
            provider: config.provider.clone(),
            tools: Vec::new(),
            custom_tools: registry.all(),
            workspace_path: config.workspace.clone(),
            sessions_dir: config.sessions_dir.clone(),
            auth_store: config.auth_store.clone(),
        };
        let sessions = SessionManager::new(factory, template);
        let _ = sessions_cell.set(Arc::clone(&sessions));

        Ok(Arc::new(Self {
            bus,
            sessions,
            subagents,
            cron,
            memory,
            flush_threshold: config.flush_threshold,
        }))
    }

    /// Load persisted cron jobs and start background maintenance.
    pub async fn start(&self) -> Result<()> {
        self.cron.start().await?;
        self.sessions.start_cleanup();
        Ok(())
    }

    /// Consume inbound messages until the bus closes.
    pub async fn run(self: Arc<Self>) {
        log::info!("[orchestrator] dispatch loop started");
        while let Some(message) = self.bus.consume_inbound().await {
            self.subagents
                .set_routing_context(&message.channel, &message.chat_id);
            let reply = self.dispatch(&message).await;
            self.bus.publish_outbound(&OutboundMessage::new(
                message.channel.clone(),
                message.chat_id.clone(),
                reply,
            ));
        }
        log::info!("[orchestrator] dispatch loop stopped");
    }

    /// Handle one inbound message, returning the reply text.
    async fn dispatch(&self, message: &InboundMessage) -> String {
        let text = message.text.trim();
        if let Some(task) = text.strip_prefix("/spawn ") {
            let id = self.subagents.spawn(SpawnRequest {
                task: task.to_owned(),
                ..Default::default()
            });
            return format!("Spawned subagent {id}; results will be announced here.");
        }
        if text == "/status" {
            return format!(
                "sessions: {} active\nsubagents: {} running\ncron: {} enabled job(s)",
                self.sessions.session_count(),
                self.subagents
                    .list(Some(crate::subagent::SubagentStatus::Running))
                    .len(),
                self.cron.list(false).len(),
            );
        }

        match self.turn(&message.channel, &message.chat_id, text).await {
            Ok(reply) => reply,
            Err(e) => format!("Error: {e}"),
        }
    }

    /// Run one user turn, preceded by the pre-compaction memory flush when
    /// the session's context is nearly full.
    pub async fn turn(&self, channel: &str, chat_id: &str, text: &str) -> Result<String> {
        let key = SessionKey::build(channel, chat_id, None);
        let threshold = self.flush_threshold;
        let prompt = text.to_owned();
        self.sessions
            .with_session(&key, |session| async move {
                if let Some(usage) = session.context_usage()
                    && usage.percent >= threshold
                {
                    log::info!(
                        "[orchestrator] context at {:.0}%; flushing memory",
                        usage.percent * 100.0
                    );
                    if let Err(e) = session.prompt(FLUSH_PROMPT).await {
                        log::warn!("[orchestrator] memory flush failed: {e}");
                    }
                }
                session.prompt(&prompt).await?;
                Ok(session.last_assistant_text().unwrap_or_default())
            })
            .await
    }

    /// Stop background work and release every session.
    pub async fn close(&self) {
        self.bus.close();
        self.cron.stop().await;
        self.sessions.close().await;
        self.memory.close();
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn cron(&self) -> &Arc<CronService> {
        &self.cron
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }
}

// ─── Cron payload routing ────────────────────────────────────────────────────

fn cron_executor(
    bus: Arc<MessageBus>,
    sessions_cell: Arc<OnceLock<Arc<SessionManager>>>,
) -> JobExecutor {
    Arc::new(move |job: CronJob| {
        let bus = Arc::clone(&bus);
        let sessions_cell = Arc::clone(&sessions_cell);
        Box::pin(async move {
            match job.payload {
                Payload::SystemEvent { text } => {
                    bus.publish_inbound(InboundMessage::new("cron", job.id.clone(), text));
                    Ok("system event published".to_owned())
                }
                Payload::AgentTurn {
                    message,
                    deliver,
                    channel,
                    chat_id,
                } => {
                    let sessions = sessions_cell
                        .get()
                        .ok_or_else(|| Error::runtime("session manager not initialized"))?;
                    let key = SessionKey::build("cron", &job.id, None);
                    let reply = sessions
                        .with_session(&key, |session| async move {
                            session.prompt(&message).await?;
                            Ok(session.last_assistant_text().unwrap_or_default())
                        })
                        .await?;
                    if deliver.unwrap_or(false) {
                        bus.publish_outbound(&OutboundMessage::new(
                            channel.unwrap_or_else(|| "cron".to_owned()),
                            chat_id.unwrap_or_else(|| job.id.clone()),
                            reply.clone(),
                        ));
                    }
                    Ok(reply)
                }
            }
        })
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
