//! Structured agent memory.
//!
//! Entries are append-only: once written they are never mutated or deleted.
//! An entry without a session id is *global* and visible to every search; an
//! entry with one is private to that session. Scoring blends recency,
//! caller-assigned importance, and keyword relevance.

mod store;
pub mod tools;

pub use store::{MemoryStore, SearchRequest, ScoreWeights};

use serde::{Deserialize, Serialize};

/// One remembered fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub content: String,
    /// Caller-assigned weight in `[0, 1]`.
    pub importance: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// `None` means global; `Some` scopes the entry to one session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Search score, populated on results only.
    #[serde(skip)]
    pub score: f64,
}
