//! Agent-callable tools backed by the memory store.
//!
//! `remember` appends a fact; `recall` runs a scoped, ranked search. Both
//! are withheld from subagent sessions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{Tool, ToolResult};

use super::{MemoryStore, SearchRequest};

// ─── RememberTool ────────────────────────────────────────────────────────────

/// Agent tool: store a fact in memory.
pub struct RememberTool {
    memory: Arc<MemoryStore>,
}

impl RememberTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store a fact in the agent's persistent memory. \
         Use this to keep information across sessions and restarts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["content"],
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Text content to remember."
                },
                "importance": {
                    "type": "number",
                    "description": "Weight in [0, 1]. Defaults to 0.5.",
                    "default": 0.5
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Labels for later filtering."
                },
                "session_id": {
                    "type": "string",
                    "description": "Scope the entry to one session. Omit for a global entry."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or("missing required parameter 'content'")?;
        let importance = args
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        let tags: Vec<String> = args
            .get("tags")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let session_id = args
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let entry = self
            .memory
            .add(content, importance, tags, session_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolResult::ok(format!("Remembered (id: {})", entry.id))
            .with_metadata(json!({"id": entry.id})))
    }
}

// ─── RecallTool ──────────────────────────────────────────────────────────────

/// Agent tool: ranked search over memory.
pub struct RecallTool {
    memory: Arc<MemoryStore>,
}

impl RecallTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Search the agent's persistent memory. Returns the most relevant \
         entries ranked by recency, importance, and keyword relevance."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Free-text search query."
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Keep only entries carrying one of these tags."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results. Defaults to 10."
                },
                "session_id": {
                    "type": "string",
                    "description": "Also include entries private to this session."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let request = SearchRequest {
            query: args
                .get("query")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tags: args
                .get("tags")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            session_id: args
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            max_results: args
                .get("limit")
                .and_then(Value::as_u64)
                .map(|limit| limit as usize),
            ..Default::default()
        };

        let results = self.memory.search(request).await.map_err(|e| e.to_string())?;
        if results.is_empty() {
            return Ok(ToolResult::ok("No matching memories."));
        }
        let lines: Vec<String> = results
            .iter()
            .map(|e| format!("- [{:.2}] {}", e.score, e.content))
            .collect();
        let count = results.len();
        Ok(ToolResult::ok(lines.join("\n")).with_metadata(json!({
            "count": count,
            "ids": results.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
        })))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_tools() -> (TempDir, RememberTool, RecallTool) {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::open(dir.path()).unwrap());
        (
            dir,
            RememberTool::new(Arc::clone(&memory)),
            RecallTool::new(memory),
        )
    }

    #[tokio::test]
    async fn remember_then_recall() {
        let (_dir, remember, recall) = make_tools();
        let stored = remember
            .execute(json!({
                "content": "the staging database lives on port 5433",
                "importance": 0.9,
                "tags": ["infra"]
            }))
            .await
            .unwrap();
        assert!(stored.success);

        let found = recall
            .execute(json!({"query": "staging database"}))
            .await
            .unwrap();
        assert!(found.success);
        assert!(found.output.contains("5433"));
    }

    #[tokio::test]
    async fn remember_requires_content() {
        let (_dir, remember, _recall) = make_tools();
        let result = remember.execute(json!({"importance": 0.5})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn recall_empty_store_reports_no_matches() {
        let (_dir, _remember, recall) = make_tools();
        let result = recall.execute(json!({"query": "anything"})).await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("No matching memories"));
    }

    #[tokio::test]
    async fn recall_respects_session_scope() {
        let (_dir, remember, recall) = make_tools();
        remember
            .execute(json!({"content": "secret of session one", "session_id": "s1"}))
            .await
            .unwrap();

        let other = recall
            .execute(json!({"query": "secret", "session_id": "s2"}))
            .await
            .unwrap();
        assert!(other.output.contains("No matching memories"));

        let owner = recall
            .execute(json!({"query": "secret", "session_id": "s1"}))
            .await
            .unwrap();
        assert!(owner.output.contains("session one"));
    }
}
