//! Background subagents.
//!
//! A subagent is a fire-and-forget task that runs a single prompt in a fresh,
//! isolated LLM session and announces its result back to whichever
//! `(channel, chatId)` requested it. Subagents never share sessions with the
//! main agent, never spawn subagents of their own, and see a reduced tool
//! list (no scheduling, memory, or subagent tools).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    bus::{MessageBus, OutboundMessage},
    llm::{SessionConfig, SessionFactory},
    session::SessionTemplate,
};

/// Default retention for finished subagent records (30 minutes).
pub const DEFAULT_CLEANUP_AGE_MS: i64 = 30 * 60 * 1000;

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
}

/// Where announcements for a subagent are routed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub channel: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentStats {
    pub runtime_ms: i64,
}

/// One background task and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subagent {
    pub id: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: SubagentStatus,
    /// Synthetic key, distinct from every supervisor-level session key.
    pub session_key: String,
    pub requester: Requester,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stats: SubagentStats,
}

/// Parameters for [`SubagentManager::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub task: String,
    pub label: Option<String>,
    /// Announcement channel; defaults to the current routing context.
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    /// `> 0` arms a cancellation signal after that many seconds.
    pub timeout_seconds: Option<u64>,
}

// ─── SubagentManager ─────────────────────────────────────────────────────────

struct Inner {
    records: HashMap<String, Subagent>,
    cancels: HashMap<String, watch::Sender<bool>>,
}

/// Spawns and tracks background subagents for one agent process.
pub struct SubagentManager {
    factory: Arc<dyn SessionFactory>,
    /// Template whose `custom_tools` already exclude the denied set.
    template: SessionTemplate,
    bus: Arc<MessageBus>,
    /// Agent id embedded in synthetic session keys.
    parent_id: String,
    inner: Mutex<Inner>,
    /// `(channel, chatId)` of the message currently being dispatched.
    routing: Mutex<Requester>,
}

impl SubagentManager {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        template: SessionTemplate,
        bus: Arc<MessageBus>,
        parent_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            template,
            bus,
            parent_id: parent_id.into(),
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                cancels: HashMap::new(),
            }),
            routing: Mutex::new(Requester {
                channel: "cli".to_owned(),
                chat_id: "default".to_owned(),
            }),
        })
    }

    /// Update the routing context before dispatching an inbound message, so
    /// subagents spawned during the turn announce back to its originator.
    pub fn set_routing_context(&self, channel: &str, chat_id: &str) {
        let mut routing = lock(&self.routing);
        routing.channel = channel.to_owned();
        routing.chat_id = chat_id.to_owned();
    }

    /// Register and start a subagent; returns its id immediately.
    pub fn spawn(self: &Arc<Self>, request: SpawnRequest) -> String {
        let id = short_id();
        let session_key = format!("subagent:{}:{}", self.parent_id, id);
        let requester = {
            let routing = lock(&self.routing);
            Requester {
                channel: request.channel.unwrap_or_else(|| routing.channel.clone()),
                chat_id: request.chat_id.unwrap_or_else(|| routing.chat_id.clone()),
            }
        };
        let record = Subagent {
            id: id.clone(),
            task: request.task.clone(),
            label: request.label.clone(),
            status: SubagentStatus::Running,
            session_key: session_key.clone(),
            requester,
            created_at: Utc::now().timestamp_millis(),
            completed_at: None,
            result: None,
            error: None,
            stats: SubagentStats::default(),
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut inner = lock(&self.inner);
            inner.records.insert(id.clone(), record);
            inner.cancels.insert(id.clone(), cancel_tx);
        }
        log::info!("[subagents] spawned {id} ({} chars of task)", request.task.len());

        let manager = Arc::clone(self);
        let timeout = request.timeout_seconds.filter(|&secs| secs > 0);
        let worker_id = id.clone();
        tokio::spawn(async move {
            manager
                .drive(worker_id, session_key, request.task, timeout, cancel_rx)
                .await;
        });
        id
    }

    /// Background worker: create the session, prompt once, settle the record.
    async fn drive(
        self: Arc<Self>,
        id: String,
        session_key: String,
        task: String,
        timeout_seconds: Option<u64>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let started = Utc::now().timestamp_millis();
        let work = self.run_task(&session_key, &task);
        let timeout = async {
            match timeout_seconds {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel_rx.changed() => {
                // stop() already settled the record and announced.
                log::debug!("[subagents] {id} cancelled");
            }
            () = timeout => {
                let runtime_ms = Utc::now().timestamp_millis() - started;
                if self.settle(&id, SubagentStatus::Failed, None, Some("Timeout exceeded".to_owned()), runtime_ms) {
                    self.announce(&id, format!("[Subagent {id} failed]\n\nTimeout exceeded"));
                }
            }
            result = work => {
                let runtime_ms = Utc::now().timestamp_millis() - started;
                match result {
                    Ok(findings) => {
                        if self.settle(&id, SubagentStatus::Completed, Some(findings.clone()), None, runtime_ms) {
                            let label = self.label_suffix(&id);
                            self.announce(&id, format!(
                                "[Subagent {id}{label} completed successfully]\n\n{findings}\n\n(runtime: {runtime_ms}ms)"
                            ));
                        }
                    }
                    Err(e) => {
                        if self.settle(&id, SubagentStatus::Failed, None, Some(e.clone()), runtime_ms) {
                            self.announce(&id, format!("[Subagent {id} failed]\n\n{e}"));
                        }
                    }
                }
            }
        }
        lock(&self.inner).cancels.remove(&id);
    }

    async fn run_task(&self, session_key: &str, task: &str) -> std::result::Result<String, String> {
        let config = SessionConfig {
            model: self.template.model.clone(),
            tools: self.template.tools.clone(),
            custom_tools: self.template.custom_tools.clone(),
            workspace_path: self.template.workspace_path.clone(),
            session_directory: self
                .template
                .sessions_dir
                .join(session_key.replace(':', "_")),
            auth_store: self.template.auth_store.clone(),
            provider: self.template.provider.clone(),
        };
        let session = self
            .factory
            .create_session(config)
            .await
            .map_err(|e| e.to_string())?;

        let prompt = format!(
            "[Background subagent context]\n\
             You are a background subagent with a limited tool set. Complete \
             the task below and reply with your findings; your reply is \
             announced to the requester verbatim.\n\
             Session: {session_key}\n\
             Started: {}\n\n\
             Task: {task}",
            Utc::now().to_rfc3339(),
        );
        session.prompt(&prompt).await.map_err(|e| e.to_string())?;
        let findings = session
            .last_assistant_text()
            .unwrap_or_else(|| "Done".to_owned());
        let _ = session.close().await;
        Ok(findings)
    }

    /// Stop a running subagent. Returns whether anything was stopped.
    pub fn stop(&self, id: &str) -> bool {
        let runtime_ms = {
            let inner = lock(&self.inner);
            match inner.records.get(id) {
                Some(record) if record.status == SubagentStatus::Running => {
                    Utc::now().timestamp_millis() - record.created_at
                }
                _ => return false,
            }
        };
        if !self.settle(
            id,
            SubagentStatus::Completed,
            Some("Stopped by request".to_owned()),
            None,
            runtime_ms,
        ) {
            return false;
        }
        if let Some(cancel) = lock(&self.inner).cancels.remove(id) {
            let _ = cancel.send(true);
        }
        self.announce(id, format!("[Subagent {id} stopped]\n\n(runtime: {runtime_ms}ms)"));
        log::info!("[subagents] stopped {id}");
        true
    }

    pub fn get(&self, id: &str) -> Option<Subagent> {
        lock(&self.inner).records.get(id).cloned()
    }

    /// List records, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<SubagentStatus>) -> Vec<Subagent> {
        let inner = lock(&self.inner);
        let mut records: Vec<Subagent> = inner
            .records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        records
    }

    /// Drop finished records older than `max_age_ms`. Returns how many were
    /// removed.
    pub fn cleanup(&self, max_age_ms: i64) -> usize {
        let cutoff = Utc::now().timestamp_millis() - max_age_ms;
        let mut inner = lock(&self.inner);
        let before = inner.records.len();
        inner.records.retain(|_, r| {
            r.status == SubagentStatus::Running
                || r.completed_at.unwrap_or(r.created_at) >= cutoff
        });
        before - inner.records.len()
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    /// Move a still-running record to a terminal state. Returns `false` when
    /// the record is gone or already settled (e.g. the timeout branch lost
    /// the race against `stop`).
    fn settle(
        &self,
        id: &str,
        status: SubagentStatus,
        result: Option<String>,
        error: Option<String>,
        runtime_ms: i64,
    ) -> bool {
        let mut inner = lock(&self.inner);
        match inner.records.get_mut(id) {
            Some(record) if record.status == SubagentStatus::Running => {
                record.status = status;
                record.result = result;
                record.error = error;
                record.completed_at = Some(Utc::now().timestamp_millis());
                record.stats.runtime_ms = runtime_ms;
                true
            }
            _ => false,
        }
    }

    fn announce(&self, id: &str, text: String) {
        let requester = match lock(&self.inner).records.get(id) {
            Some(record) => record.requester.clone(),
            None => return,
        };
        self.bus.publish_outbound(&OutboundMessage::new(
            requester.channel,
            requester.chat_id,
            text,
        ));
    }

    fn label_suffix(&self, id: &str) -> String {
        lock(&self.inner)
            .records
            .get(id)
            .and_then(|r| r.label.as_ref())
            .map(|label| format!(" ({label})"))
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Opaque 8-character id.
fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::llm::{AgentSession, AuthStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSession {
        reply: Option<String>,
        delay: Duration,
    }

    #[async_trait]
    impl AgentSession for ScriptedSession {
        async fn prompt(&self, _text: &str) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
        fn last_assistant_text(&self) -> Option<String> {
            self.reply.clone()
        }
    }

    struct ScriptedFactory {
        reply: Option<String>,
        delay: Duration,
        creations: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn create_session(&self, _config: SessionConfig) -> Result<Arc<dyn AgentSession>> {
            self.creations.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedSession {
                reply: self.reply.clone(),
                delay: self.delay,
            }))
        }
    }

    fn make_manager(
        reply: Option<&str>,
        delay: Duration,
    ) -> (tempfile::TempDir, Arc<MessageBus>, Arc<SubagentManager>) {
        let dir = tempfile::TempDir::new().unwrap();
        let bus = Arc::new(MessageBus::new());
        let factory = Arc::new(ScriptedFactory {
            reply: reply.map(str::to_owned),
            delay,
            creations: AtomicUsize::new(0),
        });
        let template = SessionTemplate {
            model: "gpt-4o".to_owned(),
            provider: "openai".to_owned(),
            tools: Vec::new(),
            custom_tools: Vec::new(),
            workspace_path: dir.path().join("workspace"),
            sessions_dir: dir.path().join("sessions"),
            auth_store: AuthStore::new(),
        };
        let manager = SubagentManager::new(factory, template, Arc::clone(&bus), "worker");
        (dir, bus, manager)
    }

    fn collect_announcements(bus: &MessageBus) -> Arc<Mutex<Vec<OutboundMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "cli",
            Arc::new(move |m: &OutboundMessage| {
                sink.lock().unwrap().push(m.clone());
            }),
        );
        seen
    }

    async fn wait_until_settled(manager: &SubagentManager, id: &str) -> Subagent {
        for _ in 0..600 {
            if let Some(record) = manager.get(id)
                && record.status != SubagentStatus::Running
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subagent {id} never settled");
    }

    #[tokio::test]
    async fn successful_subagent_announces_findings() {
        let (_dir, bus, manager) = make_manager(Some("the answer is 42"), Duration::ZERO);
        let seen = collect_announcements(&bus);

        let id = manager.spawn(SpawnRequest {
            task: "find the answer".to_owned(),
            label: Some("research".to_owned()),
            ..Default::default()
        });
        let record = wait_until_settled(&manager, &id).await;

        assert_eq!(record.status, SubagentStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("the answer is 42"));
        assert_eq!(record.session_key, format!("subagent:worker:{id}"));
        assert!(record.stats.runtime_ms >= 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let announcements = seen.lock().unwrap();
        assert_eq!(announcements.len(), 1);
        assert!(announcements[0]
            .text
            .contains(&format!("[Subagent {id} (research) completed successfully]")));
        assert!(announcements[0].text.contains("the answer is 42"));
    }

    #[tokio::test]
    async fn missing_reply_falls_back_to_done() {
        let (_dir, _bus, manager) = make_manager(None, Duration::ZERO);
        let id = manager.spawn(SpawnRequest {
            task: "silent task".to_owned(),
            ..Default::default()
        });
        let record = wait_until_settled(&manager, &id).await;
        assert_eq!(record.result.as_deref(), Some("Done"));
    }

    #[tokio::test]
    async fn timeout_marks_failed() {
        let (_dir, bus, manager) = make_manager(Some("late"), Duration::from_secs(30));
        let seen = collect_announcements(&bus);

        let id = manager.spawn(SpawnRequest {
            task: "slow task".to_owned(),
            timeout_seconds: Some(1),
            ..Default::default()
        });
        let record = tokio::time::timeout(
            Duration::from_secs(5),
            wait_until_settled(&manager, &id),
        )
        .await
        .unwrap();

        assert_eq!(record.status, SubagentStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("Timeout exceeded"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().unwrap()[0].text.contains("Timeout exceeded"));
    }

    #[tokio::test]
    async fn stop_settles_and_announces() {
        let (_dir, bus, manager) = make_manager(Some("never"), Duration::from_secs(30));
        let seen = collect_announcements(&bus);

        let id = manager.spawn(SpawnRequest {
            task: "runs forever".to_owned(),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.stop(&id), "stop on a running subagent succeeds");
        assert!(!manager.stop(&id), "second stop is a no-op");

        let record = manager.get(&id).unwrap();
        assert_eq!(record.status, SubagentStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("Stopped by request"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let announcements = seen.lock().unwrap();
        assert_eq!(announcements.len(), 1, "only the stop announcement fires");
        assert!(announcements[0].text.contains("stopped"));
    }

    #[tokio::test]
    async fn routing_context_directs_announcements() {
        let (_dir, bus, manager) = make_manager(Some("hi"), Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "telegram",
            Arc::new(move |m: &OutboundMessage| {
                sink.lock().unwrap().push(m.clone());
            }),
        );

        manager.set_routing_context("telegram", "chat-99");
        let id = manager.spawn(SpawnRequest {
            task: "report back".to_owned(),
            ..Default::default()
        });
        wait_until_settled(&manager, &id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let announcements = seen.lock().unwrap();
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].chat_id, "chat-99");
    }

    #[tokio::test]
    async fn cleanup_removes_old_finished_records() {
        let (_dir, _bus, manager) = make_manager(Some("done"), Duration::ZERO);
        let id = manager.spawn(SpawnRequest {
            task: "quick".to_owned(),
            ..Default::default()
        });
        wait_until_settled(&manager, &id).await;

        assert_eq!(manager.cleanup(60_000), 0, "fresh records survive");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.cleanup(0), 1, "age-zero cutoff removes finished");
        assert!(manager.get(&id).is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (_dir, _bus, manager) = make_manager(Some("done"), Duration::ZERO);
        let fast = manager.spawn(SpawnRequest {
            task: "fast".to_owned(),
            ..Default::default()
        });
        wait_until_settled(&manager, &fast).await;

        let completed = manager.list(Some(SubagentStatus::Completed));
        assert_eq!(completed.len(), 1);
        assert!(manager.list(Some(SubagentStatus::Running)).is_empty());
        assert_eq!(manager.list(None).len(), 1);
    }
}
