//! Top-level options for constructing a supervisor.
//!
//! All fields have defaults so a zero-configuration `TinycrabOptions::default()`
//! works out of the box; `from_env` layers the `AGENT_*` environment variables
//! on top.
//!
//! Recognized environment variables:
//! ```text
//! AGENT_PROVIDER   default "openai"
//! AGENT_MODEL      default "gpt-4o"
//! AGENT_WORKSPACE  workspace override for in-process mode
//! AGENT_DATA_DIR   default "./.tinycrab"
//! AGENT_PORT       first port the allocator probes (default 9000)
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── RunMode ─────────────────────────────────────────────────────────────────

/// Where agent processes run.
///
/// Only `Local` is implemented; `Docker` and `Remote` are recognized in
/// configuration so option files round-trip, and rejected at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Local,
    Docker,
    Remote,
}

// ─── TinycrabOptions ─────────────────────────────────────────────────────────

/// Options accepted by [`Supervisor::new`](crate::supervisor::Supervisor::new).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TinycrabOptions {
    /// API key for the configured provider.  `None` falls back to the
    /// provider's environment variable at agent-server startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// LLM provider id (e.g. `"openai"`, `"anthropic"`).
    pub provider: String,
    /// Model identifier passed through to the runtime.
    pub model: String,
    /// Execution mode.  Only [`RunMode::Local`] is supported.
    pub mode: RunMode,
    /// Root of the supervisor's data directory.
    pub data_dir: PathBuf,
    /// Remote supervisor URL (remote mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Container image (docker mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Agent-server executable.  `None` resolves to the `tinycrab-server`
    /// binary next to the current executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_program: Option<PathBuf>,
    /// First port the serial allocator probes.
    pub base_port: u16,
}

impl Default for TinycrabOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: "openai".to_owned(),
            model: "gpt-4o".to_owned(),
            mode: RunMode::Local,
            data_dir: PathBuf::from("./.tinycrab"),
            url: None,
            image: None,
            server_program: None,
            base_port: 9000,
        }
    }
}

impl TinycrabOptions {
    /// Build options from the `AGENT_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(provider) = std::env::var("AGENT_PROVIDER")
            && !provider.is_empty()
        {
            opts.provider = provider;
        }
        if let Ok(model) = std::env::var("AGENT_MODEL")
            && !model.is_empty()
        {
            opts.model = model;
        }
        if let Ok(dir) = std::env::var("AGENT_DATA_DIR")
            && !dir.is_empty()
        {
            opts.data_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("AGENT_PORT")
            && let Ok(port) = port.parse()
        {
            opts.base_port = port;
        }
        opts
    }

    /// Resolve the agent-server executable to launch.
    pub fn resolve_server_program(&self) -> PathBuf {
        if let Some(ref program) = self.server_program {
            return program.clone();
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("tinycrab-server")));
        match sibling {
            Some(path) if path.exists() => path,
            _ => PathBuf::from("tinycrab-server"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
