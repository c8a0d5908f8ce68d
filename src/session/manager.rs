//! The per-agent session cache.
//!
//! Responsibilities:
//! - **Single-flight creation** — concurrent `get_or_create` calls for the
//!   same key join one construction; at most one live session object exists
//!   per key at any instant.
//! - **Per-key serialization** — [`SessionManager::with_session`] queues
//!   turns on a per-key FIFO lock, so turns on one key never interleave while
//!   turns on different keys run concurrently. A failed turn does not poison
//!   the queue; the error propagates to its own caller only.
//! - **LRU eviction** — inserting past `max_sessions` synchronously picks the
//!   least-recently-accessed session as victim and closes it in the
//!   background; the new session is returned without waiting for that close.
//! - **TTL cleanup** — a background sweep closes sessions idle longer than
//!   the TTL, ticking every `max(60s, ttl / 6)`.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use tokio::sync::watch;

use crate::{
    error::{Error, Result},
    llm::{AgentSession, AuthStore, SessionConfig, SessionFactory},
    tools::Tool,
};

use super::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TTL_MS, SessionKey};

// ─── SessionTemplate ─────────────────────────────────────────────────────────

/// Per-agent fields copied into every new session's [`SessionConfig`].
#[derive(Clone)]
pub struct SessionTemplate {
    pub model: String,
    pub provider: String,
    /// Runtime-provided tool names, passed through opaquely.
    pub tools: Vec<String>,
    pub custom_tools: Vec<Arc<dyn Tool>>,
    pub workspace_path: std::path::PathBuf,
    /// Parent directory for per-session history directories.
    pub sessions_dir: std::path::PathBuf,
    pub auth_store: AuthStore,
}

impl SessionTemplate {
    fn config_for(&self, key: &str) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            tools: self.tools.clone(),
            custom_tools: self.custom_tools.clone(),
            workspace_path: self.workspace_path.clone(),
            session_directory: self.sessions_dir.join(key.replace(':', "_")),
            auth_store: self.auth_store.clone(),
            provider: self.provider.clone(),
        }
    }
}

// ─── SessionSlot ─────────────────────────────────────────────────────────────

/// A cached session plus its serialization state.
pub struct SessionSlot {
    pub key: String,
    pub session: Arc<dyn AgentSession>,
    pub created_at: i64,
    last_accessed: AtomicI64,
    /// FIFO turn lock: holders run in arrival order.
    turn_lock: tokio::sync::Mutex<()>,
}

impl SessionSlot {
    fn touch(&self) {
        self.last_accessed
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_accessed_ms(&self) -> i64 {
        self.last_accessed.load(Ordering::SeqCst)
    }
}

type CreateResult = std::result::Result<Arc<SessionSlot>, String>;

struct Inner {
    sessions: HashMap<String, Arc<SessionSlot>>,
    /// In-flight creations; joiners await the watch value.
    pending: HashMap<String, watch::Receiver<Option<CreateResult>>>,
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// LRU, TTL-bounded cache of LLM sessions with single-flight creation.
pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    template: SessionTemplate,
    max_sessions: usize,
    session_ttl_ms: i64,
    inner: Mutex<Inner>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn SessionFactory>, template: SessionTemplate) -> Arc<Self> {
        Self::with_limits(
            factory,
            template,
            DEFAULT_MAX_SESSIONS,
            DEFAULT_SESSION_TTL_MS,
        )
    }

    pub fn with_limits(
        factory: Arc<dyn SessionFactory>,
        template: SessionTemplate,
        max_sessions: usize,
        session_ttl_ms: i64,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            factory,
            template,
            max_sessions,
            session_ttl_ms,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                pending: HashMap::new(),
            }),
            stop_tx,
            stop_rx,
        })
    }

    /// Start the idle-session sweep task.
    pub fn start_cleanup(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        let tick = Duration::from_millis((self.session_ttl_ms / 6).max(60_000) as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep_expired().await;
                    }
                    Ok(()) = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Resolve (or create) the session for `parts`.
    pub async fn get_or_create(&self, parts: &SessionKey) -> Result<Arc<SessionSlot>> {
        self.get_or_create_by_key(&parts.as_str()).await
    }

    /// Resolve (or create) the session for a canonical key string.
    pub async fn get_or_create_by_key(&self, key: &str) -> Result<Arc<SessionSlot>> {
        enum Plan {
            Hit(Arc<SessionSlot>),
            Join(watch::Receiver<Option<CreateResult>>),
            Create {
                publish: watch::Sender<Option<CreateResult>>,
                victim: Option<Arc<SessionSlot>>,
            },
        }

        let plan = {
            let mut inner = self.lock_inner();
            if let Some(slot) = inner.sessions.get(key) {
                slot.touch();
                Plan::Hit(Arc::clone(slot))
            } else if let Some(rx) = inner.pending.get(key) {
                Plan::Join(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inner.pending.insert(key.to_owned(), rx);
                // Synchronously mark the LRU victim before suspending on the
                // factory, so concurrent creates cannot both skip eviction.
                let victim = if inner.sessions.len() >= self.max_sessions {
                    pick_lru(&inner.sessions)
                        .and_then(|victim_key| inner.sessions.remove(&victim_key))
                } else {
                    None
                };
                Plan::Create {
                    publish: tx,
                    victim,
                }
            }
        };

        match plan {
            Plan::Hit(slot) => Ok(slot),
            Plan::Join(mut rx) => loop {
                if let Some(result) = rx.borrow().clone() {
                    return result.map_err(Error::Runtime);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::runtime("session creation abandoned"));
                }
            },
            Plan::Create { publish, victim } => {
                if let Some(victim) = victim {
                    log::info!("[sessions] evicting LRU session '{}'", victim.key);
                    tokio::spawn(close_slot(victim));
                }
                let created = self
                    .factory
                    .create_session(self.template.config_for(key))
                    .await;
                let mut inner = self.lock_inner();
                inner.pending.remove(key);
                match created {
                    Ok(session) => {
                        let now = Utc::now().timestamp_millis();
                        let slot = Arc::new(SessionSlot {
                            key: key.to_owned(),
                            session,
                            created_at: now,
                            last_accessed: AtomicI64::new(now),
                            turn_lock: tokio::sync::Mutex::new(()),
                        });
                        inner.sessions.insert(key.to_owned(), Arc::clone(&slot));
                        drop(inner);
                        let _ = publish.send(Some(Ok(Arc::clone(&slot))));
                        log::debug!("[sessions] created session '{key}'");
                        Ok(slot)
                    }
                    Err(e) => {
                        drop(inner);
                        let _ = publish.send(Some(Err(e.to_string())));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Run `f` against the session for `parts`, serialized after every turn
    /// already queued on the same key. Turns on other keys are unaffected.
    pub async fn with_session<F, Fut, T>(&self, parts: &SessionKey, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn AgentSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = self.get_or_create(parts).await?;
        let _turn = slot.turn_lock.lock().await;
        slot.touch();
        f(Arc::clone(&slot.session)).await
    }

    /// Keys of every cached session.
    pub fn list_sessions(&self) -> Vec<String> {
        let inner = self.lock_inner();
        let mut keys: Vec<String> = inner.sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn session_count(&self) -> usize {
        self.lock_inner().sessions.len()
    }

    /// Close sessions idle longer than the TTL.
    pub async fn sweep_expired(&self) {
        let cutoff = Utc::now().timestamp_millis() - self.session_ttl_ms;
        let expired: Vec<Arc<SessionSlot>> = {
            let mut inner = self.lock_inner();
            let keys: Vec<String> = inner
                .sessions
                .iter()
                .filter(|(_, slot)| slot.last_accessed_ms() < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| inner.sessions.remove(key))
                .collect()
        };
        for slot in expired {
            log::info!("[sessions] closing idle session '{}'", slot.key);
            close_slot(slot).await;
        }
    }

    /// Stop the sweep task and close every session.
    pub async fn close(&self) {
        let _ = self.stop_tx.send(true);
        let all: Vec<Arc<SessionSlot>> = {
            let mut inner = self.lock_inner();
            inner.sessions.drain().map(|(_, slot)| slot).collect()
        };
        for slot in all {
            close_slot(slot).await;
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Least-recently-accessed key; ties broken arbitrarily.
fn pick_lru(sessions: &HashMap<String, Arc<SessionSlot>>) -> Option<String> {
    sessions
        .iter()
        .min_by_key(|(_, slot)| slot.last_accessed_ms())
        .map(|(key, _)| key.clone())
}

/// Drain the slot's turn queue, then close the underlying session.
async fn close_slot(slot: Arc<SessionSlot>) {
    let _turn = slot.turn_lock.lock().await;
    if let Err(e) = slot.session.close().await {
        log::warn!("[sessions] close failed for '{}': {e}", slot.key);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct MockSession {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AgentSession for MockSession {
        async fn prompt(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        fn last_assistant_text(&self) -> Option<String> {
            None
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockFactory {
        creations: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
        closed_flags: Mutex<Vec<(String, Arc<AtomicBool>)>>,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                creations: AtomicUsize::new(0),
                delay: Duration::from_millis(10),
                fail: AtomicBool::new(false),
                closed_flags: Mutex::new(Vec::new()),
            })
        }

        fn closed(&self, key_suffix: &str) -> bool {
            self.closed_flags
                .lock()
                .unwrap()
                .iter()
                .find(|(key, _)| key.ends_with(key_suffix))
                .map(|(_, flag)| flag.load(Ordering::SeqCst))
                .unwrap_or(false)
        }
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        async fn create_session(&self, config: SessionConfig) -> Result<Arc<dyn AgentSession>> {
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::runtime("factory down"));
            }
            self.creations.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::new(AtomicBool::new(false));
            self.closed_flags.lock().unwrap().push((
                config.session_directory.to_string_lossy().into_owned(),
                Arc::clone(&closed),
            ));
            Ok(Arc::new(MockSession { closed }))
        }
    }

    fn template(dir: &std::path::Path) -> SessionTemplate {
        SessionTemplate {
            model: "gpt-4o".to_owned(),
            provider: "openai".to_owned(),
            tools: Vec::new(),
            custom_tools: Vec::new(),
            workspace_path: dir.join("workspace"),
            sessions_dir: dir.join("sessions"),
            auth_store: AuthStore::new(),
        }
    }

    fn key(chat: &str) -> SessionKey {
        SessionKey::build("cli", chat, None)
    }

    #[tokio::test]
    async fn single_flight_joins_concurrent_creates() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let manager = SessionManager::new(factory.clone(), template(dir.path()));

        let a = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_or_create(&key("same")).await })
        };
        let b = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_or_create(&key("same")).await })
        };
        let slot_a = a.await.unwrap().unwrap();
        let slot_b = b.await.unwrap().unwrap();

        assert_eq!(factory.creations.load(Ordering::SeqCst), 1, "one creation");
        assert!(Arc::ptr_eq(&slot_a, &slot_b), "both callers share the slot");
    }

    #[tokio::test]
    async fn same_key_turns_never_overlap() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SessionManager::new(MockFactory::new(), template(dir.path()));

        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = Arc::clone(&manager);
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);
            handles.push(tokio::spawn(async move {
                manager
                    .with_session(&key("serial"), |_session| async move {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(
            !overlapped.load(Ordering::SeqCst),
            "turns on one key must be strictly serial"
        );
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SessionManager::new(MockFactory::new(), template(dir.path()));

        // The first turn parks until the second turn has started; this only
        // terminates if the two keys genuinely overlap.
        let started = Arc::new(tokio::sync::Notify::new());
        let first = {
            let manager = Arc::clone(&manager);
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                manager
                    .with_session(&key("one"), |_s| async move {
                        started.notified().await;
                        Ok(())
                    })
                    .await
            })
        };
        let second = {
            let manager = Arc::clone(&manager);
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                manager
                    .with_session(&key("two"), |_s| async move {
                        started.notify_one();
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();
        })
        .await
        .expect("cross-key turns must not serialize");
    }

    #[tokio::test]
    async fn failed_turn_does_not_block_the_next() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SessionManager::new(MockFactory::new(), template(dir.path()));

        let failed = manager
            .with_session(&key("chain"), |_s| async move {
                Err::<(), Error>(Error::runtime("turn exploded"))
            })
            .await;
        assert!(failed.is_err());

        let ok = manager
            .with_session(&key("chain"), |_s| async move { Ok(42) })
            .await
            .unwrap();
        assert_eq!(ok, 42, "chain survives a failed predecessor");
    }

    #[tokio::test]
    async fn lru_eviction_closes_least_recent() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let manager =
            SessionManager::with_limits(factory.clone(), template(dir.path()), 2, 60_000);

        manager.get_or_create(&key("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.get_or_create(&key("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch "a" so "b" becomes the LRU.
        manager.get_or_create(&key("a")).await.unwrap();
        manager.get_or_create(&key("c")).await.unwrap();

        let keys = manager.list_sessions();
        assert!(!keys.contains(&"cli:b".to_owned()), "LRU key evicted");
        assert!(keys.contains(&"cli:a".to_owned()));
        assert!(keys.contains(&"cli:c".to_owned()));

        // The eviction close is fire-and-forget; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(factory.closed("cli_b"), "evicted session was closed");
    }

    #[tokio::test]
    async fn create_failure_propagates_and_clears_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let manager = SessionManager::new(factory.clone(), template(dir.path()));

        factory.fail.store(true, Ordering::SeqCst);
        let err = manager.get_or_create(&key("flaky")).await;
        assert!(err.is_err());

        factory.fail.store(false, Ordering::SeqCst);
        let ok = manager.get_or_create(&key("flaky")).await;
        assert!(ok.is_ok(), "a later create may retry after a failure");
    }

    #[tokio::test]
    async fn sweep_closes_idle_sessions() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let manager = SessionManager::with_limits(factory.clone(), template(dir.path()), 10, 1);

        manager.get_or_create(&key("idle")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.sweep_expired().await;

        assert_eq!(manager.session_count(), 0);
        assert!(factory.closed("cli_idle"));
    }

    #[tokio::test]
    async fn close_drains_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = MockFactory::new();
        let manager = SessionManager::new(factory.clone(), template(dir.path()));
        manager.get_or_create(&key("x")).await.unwrap();
        manager.get_or_create(&key("y")).await.unwrap();

        manager.close().await;
        assert_eq!(manager.session_count(), 0);
        assert!(factory.closed("cli_x"));
        assert!(factory.closed("cli_y"));
    }
}
