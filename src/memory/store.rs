//! JSONL-backed implementation of the memory store.
//!
//! One entry per line under `<memoryDir>/entries.jsonl`. Appends are
//! serialized through a single writer lock so concurrent callers never
//! interleave partial records; reads go through a lazily populated cache
//! that is invalidated on every successful append. Malformed lines are
//! skipped on load.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::MemoryEntry;

const ENTRIES_FILE: &str = "entries.jsonl";

/// Recency half-life horizon: scores decay with `exp(-age / 7 days)`.
const RECENCY_HORIZON_MS: f64 = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;

// ─── ScoreWeights ────────────────────────────────────────────────────────────

/// Relative weights of the three sub-scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub recency: f64,
    pub importance: f64,
    pub relevance: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            importance: 0.2,
            relevance: 0.5,
        }
    }
}

// ─── SearchRequest ───────────────────────────────────────────────────────────

/// Parameters for [`MemoryStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// Free-text query; absent means relevance is neutral (0.5).
    pub query: Option<String>,
    /// Keep only entries sharing at least one tag (case-insensitive).
    pub tags: Vec<String>,
    /// Scope: entries private to this session id plus all global entries.
    /// Absent keeps every entry, global and private alike.
    pub session_id: Option<String>,
    /// Maximum results; `None` means 10.
    pub max_results: Option<usize>,
    /// Drop results scoring below this threshold.
    pub min_score: f64,
    pub weights: Option<ScoreWeights>,
}

// ─── MemoryStore ─────────────────────────────────────────────────────────────

/// Append-only memory store over a JSONL file.
pub struct MemoryStore {
    path: PathBuf,
    /// Single-writer chain: appends take this lock for their full duration.
    writer: tokio::sync::Mutex<()>,
    cache: Mutex<Option<Arc<Vec<MemoryEntry>>>>,
}

impl MemoryStore {
    /// Open (or create) the store under `memory_dir`.
    pub fn open(memory_dir: &Path) -> Result<Self> {
        fs::create_dir_all(memory_dir)?;
        Ok(Self {
            path: memory_dir.join(ENTRIES_FILE),
            writer: tokio::sync::Mutex::new(()),
            cache: Mutex::new(None),
        })
    }

    /// Append a new entry and return it in full.
    pub async fn add(
        &self,
        content: &str,
        importance: f64,
        tags: Vec<String>,
        session_id: Option<String>,
    ) -> Result<MemoryEntry> {
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().timestamp_millis(),
            content: content.to_owned(),
            importance: importance.clamp(0.0, 1.0),
            tags,
            session_id,
            score: 0.0,
        };
        let line = serde_json::to_string(&entry)?;

        // Hold the writer lock across the whole append so records never
        // interleave.
        let _writer = self.writer.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        drop(file);

        self.invalidate_cache();
        log::debug!("[memory] appended entry {}", entry.id);
        Ok(entry)
    }

    /// Ranked search over the filtered entry set.
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<MemoryEntry>> {
        let entries = self.entries().await?;
        let weights = request.weights.unwrap_or_default();
        let max_results = request.max_results.unwrap_or(10);
        let now_ms = Utc::now().timestamp_millis();

        let query_tokens: Vec<String> = request
            .query
            .as_deref()
            .map(query_tokens)
            .unwrap_or_default();
        let tag_filter: HashSet<String> =
            request.tags.iter().map(|t| t.to_lowercase()).collect();

        let mut results: Vec<MemoryEntry> = entries
            .iter()
            .filter(|e| match (&request.session_id, &e.session_id) {
                // Scoped search sees global entries plus its own.
                (Some(scope), Some(owner)) => scope == owner,
                (Some(_), None) => true,
                // Unscoped search sees everything.
                (None, _) => true,
            })
            .filter(|e| {
                tag_filter.is_empty()
                    || e.tags.iter().any(|t| tag_filter.contains(&t.to_lowercase()))
            })
            .map(|e| {
                let mut scored = e.clone();
                scored.score = score_entry(e, &query_tokens, now_ms, &weights);
                scored
            })
            .filter(|e| e.score >= request.min_score)
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(max_results);
        Ok(results)
    }

    /// Fetch a single entry by id.
    pub async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let entries = self.entries().await?;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    /// List entries in insertion order, optionally filtered by tags.
    pub async fn list(
        &self,
        limit: usize,
        offset: usize,
        tags: &[String],
    ) -> Result<Vec<MemoryEntry>> {
        let entries = self.entries().await?;
        let tag_filter: HashSet<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        Ok(entries
            .iter()
            .filter(|e| {
                tag_filter.is_empty()
                    || e.tags.iter().any(|t| tag_filter.contains(&t.to_lowercase()))
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Count entries, optionally filtered by tags.
    pub async fn count(&self, tags: &[String]) -> Result<usize> {
        let entries = self.entries().await?;
        let tag_filter: HashSet<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        Ok(entries
            .iter()
            .filter(|e| {
                tag_filter.is_empty()
                    || e.tags.iter().any(|t| tag_filter.contains(&t.to_lowercase()))
            })
            .count())
    }

    /// Drop the in-memory cache. Appends remain durable; the next read
    /// reloads from disk.
    pub fn close(&self) {
        self.invalidate_cache();
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    async fn entries(&self) -> Result<Arc<Vec<MemoryEntry>>> {
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }
        // Take the writer lock so a load never races a half-written line.
        let _writer = self.writer.lock().await;
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }
        let loaded = Arc::new(self.load()?);
        self.set_cache(Arc::clone(&loaded));
        Ok(loaded)
    }

    fn load(&self) -> Result<Vec<MemoryEntry>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("[memory] skipping malformed entry line: {e}"),
            }
        }
        Ok(entries)
    }

    fn cached(&self) -> Option<Arc<Vec<MemoryEntry>>> {
        match self.cache.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cache(&self, entries: Arc<Vec<MemoryEntry>>) {
        match self.cache.lock() {
            Ok(mut guard) => *guard = Some(entries),
            Err(poisoned) => *poisoned.into_inner() = Some(entries),
        }
    }

    fn invalidate_cache(&self) {
        match self.cache.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// Query tokens: whitespace-split, lowercased, length > 2.
fn query_tokens(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

fn score_entry(
    entry: &MemoryEntry,
    query_tokens: &[String],
    now_ms: i64,
    weights: &ScoreWeights,
) -> f64 {
    let age_ms = (now_ms - entry.created_at).max(0) as f64;
    let recency = (-age_ms / RECENCY_HORIZON_MS).exp();
    let relevance = if query_tokens.is_empty() {
        0.5
    } else {
        let content = entry.content.to_lowercase();
        let matched = query_tokens
            .iter()
            .filter(|t| content.contains(t.as_str()))
            .count();
        matched as f64 / query_tokens.len() as f64
    };
    weights.recency * recency + weights.importance * entry.importance + weights.relevance * relevance
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store() -> (TempDir, MemoryStore) {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn add_and_get_round_trip() {
        let (_dir, store) = make_store();
        let entry = store
            .add("user prefers dark mode", 0.8, vec!["prefs".into()], None)
            .await
            .unwrap();
        let fetched = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "user prefers dark mode");
        assert_eq!(fetched.importance, 0.8);
        assert_eq!(fetched.tags, vec!["prefs".to_string()]);
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store.add("durable fact", 0.5, vec![], None).await.unwrap();
        }
        let reopened = MemoryStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count(&[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        store.add("good entry", 0.5, vec![], None).await.unwrap();
        // Corrupt the file with a partial record.
        let path = dir.path().join(ENTRIES_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"id\": \"truncated").unwrap();
        drop(file);

        store.close();
        assert_eq!(store.count(&[]).await.unwrap(), 1, "bad line skipped");
    }

    #[tokio::test]
    async fn global_entries_visible_to_scoped_search() {
        let (_dir, store) = make_store();
        store.add("global fact", 0.5, vec![], None).await.unwrap();
        store
            .add("private fact", 0.5, vec![], Some("s1".into()))
            .await
            .unwrap();

        let results = store
            .search(SearchRequest {
                session_id: Some("s2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let contents: Vec<&str> = results.iter().map(|e| e.content.as_str()).collect();
        assert!(contents.contains(&"global fact"));
        assert!(
            !contents.contains(&"private fact"),
            "other sessions' private entries are hidden"
        );
    }

    #[tokio::test]
    async fn private_entries_visible_only_to_owner() {
        let (_dir, store) = make_store();
        store
            .add("private fact", 0.5, vec![], Some("s1".into()))
            .await
            .unwrap();

        let own = store
            .search(SearchRequest {
                session_id: Some("s1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(own.len(), 1);

        let unscoped = store.search(SearchRequest::default()).await.unwrap();
        assert_eq!(unscoped.len(), 1, "unscoped search returns all entries");
    }

    #[tokio::test]
    async fn tags_match_case_insensitively() {
        let (_dir, store) = make_store();
        store
            .add("tagged", 0.5, vec!["Project".into()], None)
            .await
            .unwrap();
        let results = store
            .search(SearchRequest {
                tags: vec!["project".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tags, vec!["Project".to_string()], "original case preserved");
    }

    #[tokio::test]
    async fn relevance_neutral_without_long_tokens() {
        let (_dir, store) = make_store();
        store.add("anything at all", 0.0, vec![], None).await.unwrap();
        // Query of only short tokens contributes the neutral 0.5 relevance.
        let results = store
            .search(SearchRequest {
                query: Some("a of to".into()),
                weights: Some(ScoreWeights {
                    recency: 0.0,
                    importance: 0.0,
                    relevance: 1.0,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!((results[0].score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn relevance_counts_matching_tokens() {
        let (_dir, store) = make_store();
        store
            .add("the deploy failed on tuesday", 0.0, vec![], None)
            .await
            .unwrap();
        let results = store
            .search(SearchRequest {
                query: Some("deploy wednesday".into()),
                weights: Some(ScoreWeights {
                    recency: 0.0,
                    importance: 0.0,
                    relevance: 1.0,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!((results[0].score - 0.5).abs() < 1e-9, "1 of 2 tokens matched");
    }

    #[tokio::test]
    async fn min_score_and_max_results_are_applied() {
        let (_dir, store) = make_store();
        for i in 0..5 {
            store
                .add(&format!("entry {i}"), 1.0, vec![], None)
                .await
                .unwrap();
        }
        let results = store
            .search(SearchRequest {
                max_results: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 3);

        let none = store
            .search(SearchRequest {
                min_score: 2.0,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty(), "min_score above the maximum filters all");
    }

    #[tokio::test]
    async fn importance_is_clamped() {
        let (_dir, store) = make_store();
        let entry = store.add("clamped", 7.5, vec![], None).await.unwrap();
        assert_eq!(entry.importance, 1.0);
    }

    #[tokio::test]
    async fn list_respects_offset_and_limit() {
        let (_dir, store) = make_store();
        for i in 0..6 {
            store.add(&format!("e{i}"), 0.5, vec![], None).await.unwrap();
        }
        let page = store.list(2, 3, &[]).await.unwrap();
        let contents: Vec<&str> = page.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["e3", "e4"], "insertion order with offset");
    }

    #[tokio::test]
    async fn concurrent_appends_produce_valid_lines() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::open(dir.path()).unwrap());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .add(&format!("concurrent {i}"), 0.5, vec![], None)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        store.close();
        assert_eq!(store.count(&[]).await.unwrap(), 16, "no interleaved records");
    }
}
