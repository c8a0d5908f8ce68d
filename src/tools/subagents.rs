//! Agent-callable tools over the subagent manager.
//!
//! All three tools carry an `is_subagent` flag set when the tool list is
//! built for a subagent session. The flag short-circuits execution into a
//! structured error result; combined with the denied-set filtering in the
//! registry this makes nested spawning impossible even when a tool leaks
//! into the wrong list.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::subagent::{SpawnRequest, SubagentManager, SubagentStatus};

use super::{Tool, ToolResult};

// ─── SpawnSubagentTool ───────────────────────────────────────────────────────

/// Agent tool: start a background subagent.
pub struct SpawnSubagentTool {
    manager: Arc<SubagentManager>,
    is_subagent: bool,
}

impl SpawnSubagentTool {
    pub fn new(manager: Arc<SubagentManager>, is_subagent: bool) -> Self {
        Self {
            manager,
            is_subagent,
        }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Start a background subagent that works on a task independently and \
         announces its findings when done. Returns the subagent id immediately."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["task"],
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the subagent should do."
                },
                "label": {
                    "type": "string",
                    "description": "Short display label for announcements."
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Abort the subagent after this many seconds. 0 disables the timeout."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        if self.is_subagent {
            return Ok(ToolResult::err("Subagents cannot spawn subagents.")
                .with_metadata(json!({"error": "nested_spawn_blocked"})));
        }
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'task'")?;
        let label = args
            .get("label")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let timeout_seconds = args.get("timeout_seconds").and_then(Value::as_u64);

        let id = self.manager.spawn(SpawnRequest {
            task: task.to_owned(),
            label,
            channel: None,
            chat_id: None,
            timeout_seconds,
        });
        Ok(
            ToolResult::ok(format!("Spawned subagent {id}; results will be announced."))
                .with_metadata(json!({"id": id})),
        )
    }
}

// ─── StopSubagentTool ────────────────────────────────────────────────────────

/// Agent tool: stop a running subagent.
pub struct StopSubagentTool {
    manager: Arc<SubagentManager>,
    is_subagent: bool,
}

impl StopSubagentTool {
    pub fn new(manager: Arc<SubagentManager>, is_subagent: bool) -> Self {
        Self {
            manager,
            is_subagent,
        }
    }
}

#[async_trait]
impl Tool for StopSubagentTool {
    fn name(&self) -> &str {
        "stop_subagent"
    }

    fn description(&self) -> &str {
        "Stop a running subagent by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["id"],
            "properties": {
                "id": {"type": "string", "description": "Subagent id to stop."}
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        if self.is_subagent {
            return Ok(ToolResult::err("Subagents cannot manage subagents.")
                .with_metadata(json!({"error": "denied_for_subagent"})));
        }
        let id = args
            .get("id")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'id'")?;
        if self.manager.stop(id) {
            Ok(ToolResult::ok(format!("Stopped subagent {id}.")))
        } else {
            Ok(ToolResult::err(format!("No running subagent with id {id}.")))
        }
    }
}

// ─── ListSubagentsTool ───────────────────────────────────────────────────────

/// Agent tool: list subagents, optionally filtered by status.
pub struct ListSubagentsTool {
    manager: Arc<SubagentManager>,
    is_subagent: bool,
}

impl ListSubagentsTool {
    pub fn new(manager: Arc<SubagentManager>, is_subagent: bool) -> Self {
        Self {
            manager,
            is_subagent,
        }
    }
}

#[async_trait]
impl Tool for ListSubagentsTool {
    fn name(&self) -> &str {
        "list_subagents"
    }

    fn description(&self) -> &str {
        "List subagents and their status, newest first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["running", "completed", "failed"],
                    "description": "Only show subagents in this state."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        if self.is_subagent {
            return Ok(ToolResult::err("Subagents cannot manage subagents.")
                .with_metadata(json!({"error": "denied_for_subagent"})));
        }
        let status = match args.get("status").and_then(Value::as_str) {
            Some("running") => Some(SubagentStatus::Running),
            Some("completed") => Some(SubagentStatus::Completed),
            Some("failed") => Some(SubagentStatus::Failed),
            Some(other) => return Err(format!("unknown status '{other}'")),
            None => None,
        };
        let records = self.manager.list(status);
        if records.is_empty() {
            return Ok(ToolResult::ok("No subagents."));
        }
        let lines: Vec<String> = records
            .iter()
            .map(|r| {
                format!(
                    "{:<10} {:<10} {}",
                    r.id,
                    format!("{:?}", r.status).to_lowercase(),
                    r.label.as_deref().unwrap_or(&r.task)
                )
            })
            .collect();
        let count = records.len();
        Ok(ToolResult::ok(lines.join("\n")).with_metadata(json!({"count": count})))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
