//! Façade over the external LLM tool-calling runtime.
//!
//! The rest of the crate consumes exactly one capability: create a session,
//! advance it one turn at a time, and read back the last assistant text.
//! Anything satisfying [`AgentSession`] works — the HTTP-backed
//! [`runtime::ChatRuntime`] in production, scripted sessions in tests.
//! Implementations are expected to persist their own conversation history
//! under [`SessionConfig::session_directory`].

pub mod runtime;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::{error::Result, tools::Tool};

// ─── AuthStore ───────────────────────────────────────────────────────────────

/// In-memory provider → API-key mapping.
///
/// Keys live only here; they are zeroized on drop and never reach the
/// command line or a child's inherited environment.
#[derive(Clone, Default)]
pub struct AuthStore {
    keys: HashMap<String, Zeroizing<String>>,
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("providers", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: impl Into<String>, key: Zeroizing<String>) {
        self.keys.insert(provider.into(), key);
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ─── SessionConfig ───────────────────────────────────────────────────────────

/// Configuration handed to [`SessionFactory::create_session`].
#[derive(Clone)]
pub struct SessionConfig {
    /// Model identifier, passed through opaquely.
    pub model: String,
    /// Names of runtime-provided tools to enable (opaque to this crate).
    pub tools: Vec<String>,
    /// Executable tools supplied by the caller.
    pub custom_tools: Vec<Arc<dyn Tool>>,
    /// Directory the session may freely read and write.
    pub workspace_path: PathBuf,
    /// Directory for the session's persisted conversation history. A session
    /// created over a directory that already holds history resumes it.
    pub session_directory: PathBuf,
    /// Provider credentials, in memory only.
    pub auth_store: AuthStore,
    /// Provider id used to pick credentials and endpoint.
    pub provider: String,
}

impl SessionConfig {
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        workspace_path: PathBuf,
        session_directory: PathBuf,
    ) -> Self {
        Self {
            model: model.into(),
            tools: Vec::new(),
            custom_tools: Vec::new(),
            workspace_path,
            session_directory,
            auth_store: AuthStore::new(),
            provider: provider.into(),
        }
    }
}

// ─── ContextUsage ────────────────────────────────────────────────────────────

/// How full the session's context window is, in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub percent: f64,
}

// ─── AgentSession / SessionFactory ───────────────────────────────────────────

/// One live conversation inside the external runtime.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Advance the conversation by one turn, executing tool calls opaquely.
    async fn prompt(&self, text: &str) -> Result<()>;

    /// Text of the most recent assistant turn, if any.
    fn last_assistant_text(&self) -> Option<String>;

    /// Context-window fill estimate for pre-compaction hints.
    fn context_usage(&self) -> Option<ContextUsage> {
        None
    }

    /// Release runtime resources. Default no-op.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Constructor for [`AgentSession`] values.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, config: SessionConfig) -> Result<Arc<dyn AgentSession>>;
}
