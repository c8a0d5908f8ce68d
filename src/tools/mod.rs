//! Agent-callable tools.
//!
//! A [`Tool`] is a named capability the LLM runtime may invoke during a
//! turn. The [`ToolRegistry`] holds the full set for an agent; subagents get
//! a reduced list with scheduling, memory, and subagent management filtered
//! out (see [`SUBAGENT_DENIED_TOOLS`]).

pub mod cron;
pub mod subagents;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

/// Tool names never exposed to subagent sessions.
pub const SUBAGENT_DENIED_TOOLS: &[&str] = &[
    "spawn_subagent",
    "stop_subagent",
    "list_subagents",
    "remember",
    "recall",
    "cron_schedule",
    "cron_list",
    "cron_cancel",
];

// ─── ToolResult ──────────────────────────────────────────────────────────────

/// The result of executing a [`Tool`].
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Human-readable output fed back to the LLM.
    pub output: String,
    pub success: bool,
    /// Optional structured payload for machine consumption.
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ─── Tool ────────────────────────────────────────────────────────────────────

/// A capability the runtime can invoke on the agent's behalf.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"remember"`.
    fn name(&self) -> &str;

    /// Description included in the LLM tool listing.
    fn description(&self) -> &str;

    /// JSON Schema object for the accepted parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute with the given arguments. Denied operations return an error
    /// `ToolResult`, never an `Err` — the turn continues either way.
    async fn execute(&self, args: Value) -> Result<ToolResult, String>;
}

/// Summary of a registered tool for LLM tool listings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// The set of tools available to one agent process.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All tools, for the main agent's session config.
    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }

    /// The main agent's tool list minus the subagent denied set.
    pub fn for_subagent(&self) -> Vec<Arc<dyn Tool>> {
        self.tools
            .values()
            .filter(|t| !SUBAGENT_DENIED_TOOLS.contains(&t.name()))
            .cloned()
            .collect()
    }

    /// Tool descriptors for LLM listings.
    pub fn describe(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                schema: t.parameters_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct DummyTool(&'static str);

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::ok("done"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool("echo")));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn for_subagent_excludes_denied_set() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool("echo")));
        for name in SUBAGENT_DENIED_TOOLS {
            registry.register(Arc::new(DummyTool(name)));
        }
        let subagent_tools = registry.for_subagent();
        let names: Vec<&str> = subagent_tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["echo"], "only non-denied tools survive");
    }

    #[test]
    fn register_overwrites_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool("echo")));
        registry.register(Arc::new(DummyTool("echo")));
        assert_eq!(registry.len(), 1);
    }
}
