//! Durable job scheduling.
//!
//! Jobs fire one-shot (`at`), on a fixed interval (`every`), or on a 5-field
//! cron expression. A job's payload is either a system event published on
//! the inbound bus or a full agent turn. The whole job list is persisted to
//! `cron.json` after every mutation and reloaded on start.

mod service;

pub use service::{CronService, JobExecutor, RunKind};

use serde::{Deserialize, Serialize};

pub type JobId = String;

// ─── Schedule ────────────────────────────────────────────────────────────────

/// When a job runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Schedule {
    /// Fire once at `at_ms`. Overdue one-shots are shifted to ~1s from now
    /// so jobs restored after downtime still fire once.
    At { at_ms: i64 },
    /// Fire every `every_ms`, aligned to `anchor_ms` when given.
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// 5-field cron expression (`min hour dom month dow`), evaluated in UTC.
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

// ─── Payload ─────────────────────────────────────────────────────────────────

/// What a job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Payload {
    /// Publish `text` on the inbound bus (channel `"cron"`, chat id = job id).
    SystemEvent { text: String },
    /// Run `message` as an agent turn in the job's own session; optionally
    /// deliver the reply to `(channel, chat_id)` on the outbound bus.
    AgentTurn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deliver: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
    },
}

// ─── Job state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

/// Mutable execution state, persisted with the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
}

// ─── CronJob ─────────────────────────────────────────────────────────────────

/// A registered job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: JobId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub payload: Payload,
    #[serde(default)]
    pub state: JobState,
}

/// Fields accepted by [`CronService::add`].
#[derive(Debug, Clone)]
pub struct CronJobInput {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub delete_after_run: bool,
    pub schedule: Schedule,
    pub payload: Payload,
}

impl CronJobInput {
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: Payload) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            schedule,
            payload,
        }
    }
}

/// Partial update for [`CronService::update`]. Ids and `created_at_ms` are
/// immutable.
#[derive(Debug, Clone, Default)]
pub struct CronJobPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub delete_after_run: Option<bool>,
    pub schedule: Option<Schedule>,
    pub payload: Option<Payload>,
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronEventKind {
    Run,
    Error,
    Skip,
}

/// Emitted after every execution path for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronEvent {
    pub kind: CronEventKind,
    pub job: CronJob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Persistence envelope ────────────────────────────────────────────────────

/// On-disk format of `cron.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CronStore {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}
