//! tinycrab — a supervisor for long-running conversational agent processes.
//!
//! Each agent is an OS process serving HTTP on a loopback port, owning a
//! filesystem workspace, independently persisted conversation sessions,
//! structured memory, scheduled jobs, and a pool of background subagents.
//! The [`supervisor::Supervisor`] spawns and addresses agents; callers hold
//! an [`supervisor::AgentHandle`] and exchange chat turns over it.

pub mod bus;
pub mod config;
pub mod cron;
pub mod error;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod subagent;
pub mod supervisor;
pub mod tools;

/// Convenience re-exports for the most commonly used types.
///
/// ```rust
/// use tinycrab::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
    pub use crate::config::TinycrabOptions;
    pub use crate::cron::{CronJob, CronJobInput, CronService, Payload, Schedule};
    pub use crate::error::{Error, Result};
    pub use crate::llm::{AgentSession, SessionConfig, SessionFactory};
    pub use crate::memory::{MemoryEntry, MemoryStore, SearchRequest};
    pub use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    pub use crate::session::{SessionKey, SessionManager};
    pub use crate::subagent::{SpawnRequest, SubagentManager};
    pub use crate::supervisor::{AgentHandle, AgentStatus, Supervisor};
    pub use crate::tools::{Tool, ToolRegistry, ToolResult};
}
