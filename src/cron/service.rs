//! The cron service: timers, execution, and persistence.
//!
//! Every mutation (add/update/remove and the bookkeeping phases of run)
//! passes through a single async operation lock, so the persisted file
//! always reflects one total order over mutations. The execution callback
//! itself runs *outside* that lock — a job whose turn schedules another job
//! re-enters the service without deadlocking.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::{sync::broadcast, task::JoinHandle};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{
    CronEvent, CronEventKind, CronJob, CronJobInput, CronJobPatch, CronStore, JobId, JobState,
    Payload, RunStatus, Schedule,
};

/// Fallback delay when a cron expression fails to parse.
const BAD_CRON_RETRY_MS: i64 = 60_000;

/// Grace delay applied to overdue one-shot jobs.
const OVERDUE_GRACE_MS: i64 = 1_000;

/// Executes one job's payload; the orchestrator supplies this.
pub type JobExecutor = Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// How [`CronService::run`] treats a job that is not yet due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Execute unconditionally.
    Force,
    /// Skip when `next_run_at_ms` is still in the future.
    Due,
}

// ─── CronService ─────────────────────────────────────────────────────────────

/// Durable one-shot/recurring scheduler for one agent process.
pub struct CronService {
    store_path: PathBuf,
    executor: JobExecutor,
    /// Serial operation chain over all list mutations.
    ops: tokio::sync::Mutex<()>,
    jobs: Mutex<Vec<CronJob>>,
    timers: Mutex<HashMap<JobId, JoinHandle<()>>>,
    running: AtomicBool,
    events: broadcast::Sender<CronEvent>,
}

impl CronService {
    /// Create a service over `store_path` (usually `<data>/cron.json`).
    pub fn new(store_path: PathBuf, executor: JobExecutor) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            store_path,
            executor,
            ops: tokio::sync::Mutex::new(()),
            jobs: Mutex::new(Vec::new()),
            timers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            events,
        })
    }

    /// Observe run/error/skip events.
    pub fn subscribe(&self) -> broadcast::Receiver<CronEvent> {
        self.events.subscribe()
    }

    /// Load persisted jobs (missing file means empty), compute next runs,
    /// and arm a timer per enabled job.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _op = self.ops.lock().await;
        let mut jobs = self.load()?;
        let now = Utc::now().timestamp_millis();
        for job in &mut jobs {
            // A one-shot that already ran stays dormant; everything else
            // (including an overdue one-shot that never fired) is scheduled.
            let spent_one_shot =
                matches!(job.schedule, Schedule::At { .. }) && job.state.last_run_at_ms.is_some();
            if job.enabled && !spent_one_shot {
                job.state.next_run_at_ms = Some(compute_next_run(&job.schedule, now));
            }
            job.state.running_at_ms = None;
        }
        *self.lock_jobs() = jobs;
        self.running.store(true, Ordering::SeqCst);
        self.save()?;

        let to_arm: Vec<(JobId, i64)> = self
            .lock_jobs()
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms.map(|at| (j.id.clone(), at)))
            .collect();
        let count = to_arm.len();
        for (id, at) in to_arm {
            self.arm_timer(id, at);
        }
        log::info!("[cron] started with {count} enabled job(s)");
        Ok(())
    }

    /// Cancel every timer and stop accepting timer fires.
    pub async fn stop(&self) {
        let _op = self.ops.lock().await;
        self.running.store(false, Ordering::SeqCst);
        let mut timers = lock(&self.timers);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        log::info!("[cron] stopped");
    }

    /// Register a new job. Returns the stored job with its fresh id.
    pub async fn add(self: &Arc<Self>, input: CronJobInput) -> Result<CronJob> {
        validate_schedule(&input.schedule)?;
        let _op = self.ops.lock().await;
        let now = Utc::now().timestamp_millis();
        let next_run_at_ms = compute_next_run(&input.schedule, now);
        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            description: input.description,
            enabled: input.enabled,
            delete_after_run: input.delete_after_run,
            created_at_ms: now,
            updated_at_ms: now,
            schedule: input.schedule,
            payload: input.payload,
            state: JobState {
                next_run_at_ms: Some(next_run_at_ms),
                ..Default::default()
            },
        };
        self.lock_jobs().push(job.clone());
        self.save()?;
        if job.enabled
            && self.running.load(Ordering::SeqCst)
            && let Some(at) = job.state.next_run_at_ms
        {
            self.arm_timer(job.id.clone(), at);
        }
        log::info!("[cron] added job '{}' ({})", job.name, job.id);
        Ok(job)
    }

    /// Merge `patch` into an existing job. The schedule change recomputes
    /// `next_run_at_ms`; the timer is re-armed to match the enabled state.
    pub async fn update(self: &Arc<Self>, id: &str, patch: CronJobPatch) -> Result<CronJob> {
        if let Some(ref schedule) = patch.schedule {
            validate_schedule(schedule)?;
        }
        let _op = self.ops.lock().await;
        let now = Utc::now().timestamp_millis();
        let updated = {
            let mut jobs = self.lock_jobs();
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| Error::not_found(format!("cron job {id}")))?;
            if let Some(name) = patch.name {
                job.name = name;
            }
            if let Some(description) = patch.description {
                job.description = description;
            }
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
            }
            if let Some(delete_after_run) = patch.delete_after_run {
                job.delete_after_run = delete_after_run;
            }
            if let Some(schedule) = patch.schedule {
                job.schedule = schedule;
                job.state.next_run_at_ms = Some(compute_next_run(&job.schedule, now));
            }
            if let Some(payload) = patch.payload {
                job.payload = payload;
            }
            job.updated_at_ms = now;
            job.clone()
        };
        self.save()?;

        self.cancel_timer(id);
        if updated.enabled
            && self.running.load(Ordering::SeqCst)
            && let Some(at) = updated.state.next_run_at_ms
        {
            self.arm_timer(updated.id.clone(), at);
        }
        Ok(updated)
    }

    /// Drop a job and cancel its timer.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _op = self.ops.lock().await;
        {
            let mut jobs = self.lock_jobs();
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            if jobs.len() == before {
                return Err(Error::not_found(format!("cron job {id}")));
            }
        }
        self.save()?;
        self.cancel_timer(id);
        log::info!("[cron] removed job {id}");
        Ok(())
    }

    /// List jobs; disabled jobs are included only on request.
    pub fn list(&self, include_disabled: bool) -> Vec<CronJob> {
        self.lock_jobs()
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.lock_jobs().iter().find(|j| j.id == id).cloned()
    }

    /// Execute a job now. `RunKind::Due` skips jobs whose next run is still
    /// in the future; `RunKind::Force` executes unconditionally.
    ///
    /// Returns the executor's output, or `None` on a due-skip. Execution
    /// errors are recorded on the job and propagated.
    pub async fn run(self: &Arc<Self>, id: &str, kind: RunKind) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();

        // Phase 1 (serialized): due check + mark running.
        let job = {
            let _op = self.ops.lock().await;
            let job = self
                .get(id)
                .ok_or_else(|| Error::not_found(format!("cron job {id}")))?;
            if kind == RunKind::Due
                && let Some(next) = job.state.next_run_at_ms
                && next > now
            {
                self.mutate_job(id, |j| {
                    j.state.last_status = Some(RunStatus::Skipped);
                });
                self.save()?;
                self.emit(CronEventKind::Skip, &job, None, None);
                log::debug!("[cron] job {id} not due yet; skipped");
                return Ok(None);
            }
            self.mutate_job(id, |j| {
                j.state.running_at_ms = Some(now);
            });
            self.save()?;
            job
        };

        // Phase 2 (unserialized): run the payload. Holding the op lock here
        // would deadlock any job whose turn mutates the job list.
        log::info!("[cron] running job '{}' ({id})", job.name);
        let outcome = (self.executor)(job.clone()).await;
        let finished = Utc::now().timestamp_millis();

        // Phase 3 (serialized): record the outcome and reschedule. A fired
        // one-shot is done; re-computing its next run would loop it through
        // the overdue grace window forever.
        let _op = self.ops.lock().await;
        let next_run = match job.schedule {
            Schedule::At { .. } => None,
            _ => Some(compute_next_run(&job.schedule, finished)),
        };
        if job.delete_after_run {
            self.lock_jobs().retain(|j| j.id != id);
            self.cancel_timer(id);
        } else {
            let ok = outcome.is_ok();
            let error_text = outcome.as_ref().err().map(ToString::to_string);
            self.mutate_job(id, |j| {
                j.state.running_at_ms = None;
                j.state.last_run_at_ms = Some(now);
                j.state.last_duration_ms = Some(finished - now);
                j.state.next_run_at_ms = next_run;
                if ok {
                    j.state.last_status = Some(RunStatus::Ok);
                    j.state.last_error = None;
                } else {
                    j.state.last_status = Some(RunStatus::Error);
                    j.state.last_error = error_text.clone();
                }
            });
            if let Some(next_run) = next_run
                && self.get(id).map(|j| j.enabled).unwrap_or(false)
                && self.running.load(Ordering::SeqCst)
            {
                self.arm_timer(id.to_owned(), next_run);
            }
        }
        self.save()?;

        let settled = self.get(id).unwrap_or(job);
        match outcome {
            Ok(output) => {
                self.emit(CronEventKind::Run, &settled, Some(output.clone()), None);
                Ok(Some(output))
            }
            Err(e) => {
                log::warn!("[cron] job {id} failed: {e}");
                self.emit(CronEventKind::Error, &settled, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    // ─── Timers ──────────────────────────────────────────────────────────────

    fn arm_timer(self: &Arc<Self>, id: JobId, next_run_at_ms: i64) {
        let service = Arc::clone(self);
        let delay_ms = (next_run_at_ms - Utc::now().timestamp_millis()).max(0) as u64;
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            // Outcome already lands on the job record and the event stream.
            let _ = service.run(&timer_id, RunKind::Due).await;
        });
        if let Some(previous) = lock(&self.timers).insert(id, handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, id: &str) {
        if let Some(handle) = lock(&self.timers).remove(id) {
            handle.abort();
        }
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    fn load(&self) -> Result<Vec<CronJob>> {
        let text = match fs::read_to_string(&self.store_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let store: CronStore = serde_json::from_str(&text)?;
        Ok(store.jobs)
    }

    fn save(&self) -> Result<()> {
        let store = CronStore {
            version: 1,
            jobs: self.lock_jobs().clone(),
        };
        let text = serde_json::to_string_pretty(&store)?;
        if let Some(parent) = self.store_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.store_path, text)?;
        Ok(())
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn mutate_job(&self, id: &str, f: impl FnOnce(&mut CronJob)) {
        let mut jobs = self.lock_jobs();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            f(job);
        }
    }

    fn emit(&self, kind: CronEventKind, job: &CronJob, result: Option<String>, error: Option<String>) {
        let _ = self.events.send(CronEvent {
            kind,
            job: job.clone(),
            result,
            error,
        });
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, Vec<CronJob>> {
        lock(&self.jobs)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Next-run computation ────────────────────────────────────────────────────

fn validate_schedule(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Every { every_ms, .. } if *every_ms <= 0 => Err(Error::validation(
            "interval schedules require every_ms > 0",
        )),
        _ => Ok(()),
    }
}

/// When the job should next fire, in ms since the epoch.
pub(crate) fn compute_next_run(schedule: &Schedule, now_ms: i64) -> i64 {
    match schedule {
        Schedule::At { at_ms } => {
            if *at_ms > now_ms {
                *at_ms
            } else {
                now_ms + OVERDUE_GRACE_MS
            }
        }
        Schedule::Every { every_ms, anchor_ms } => {
            let anchor = anchor_ms.unwrap_or(now_ms);
            anchor + ((now_ms - anchor).div_euclid(*every_ms) + 1) * every_ms
        }
        Schedule::Cron { expr, .. } => {
            // The cron crate wants a seconds field; accept the 5-field form.
            let full_expr = if expr.split_whitespace().count() == 5 {
                format!("0 {expr}")
            } else {
                expr.clone()
            };
            cron::Schedule::from_str(&full_expr)
                .ok()
                .and_then(|s| s.upcoming(Utc).next())
                .map(|dt| dt.timestamp_millis())
                .unwrap_or(now_ms + BAD_CRON_RETRY_MS)
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_executor() -> (JobExecutor, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let executor: JobExecutor = Arc::new(move |_job| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ran".to_owned())
            })
        });
        (executor, count)
    }

    fn failing_executor() -> JobExecutor {
        Arc::new(|_job| Box::pin(async { Err(Error::runtime("payload exploded")) }))
    }

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("cron.json")
    }

    fn every_job(name: &str, every_ms: i64) -> CronJobInput {
        CronJobInput::new(
            name,
            Schedule::Every {
                every_ms,
                anchor_ms: None,
            },
            Payload::SystemEvent {
                text: "tick".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn add_persists_and_computes_next_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, _count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();

        let job = service.add(every_job("tick", 60_000)).await.unwrap();
        assert!(job.state.next_run_at_ms.is_some());

        let text = fs::read_to_string(store_path(&dir)).unwrap();
        let store: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(store["version"], 1);
        assert_eq!(store["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(store["jobs"][0]["name"], "tick");
    }

    #[tokio::test]
    async fn persisted_file_matches_memory_after_each_mutation() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, _count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();

        let job = service.add(every_job("a", 60_000)).await.unwrap();
        service
            .update(
                &job.id,
                CronJobPatch {
                    name: Some("renamed".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let text = fs::read_to_string(store_path(&dir)).unwrap();
        let store: CronStore = serde_json::from_str(&text).unwrap();
        assert_eq!(store.jobs, service.list(true), "disk mirrors memory");

        service.remove(&job.id).await.unwrap();
        let text = fs::read_to_string(store_path(&dir)).unwrap();
        let store: CronStore = serde_json::from_str(&text).unwrap();
        assert!(store.jobs.is_empty());
    }

    #[tokio::test]
    async fn start_restores_jobs_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let (executor, _count) = counting_executor();
            let service = CronService::new(store_path(&dir), executor);
            service.start().await.unwrap();
            service.add(every_job("persisted", 60_000)).await.unwrap();
            service.stop().await;
        }
        let (executor, _count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();
        let jobs = service.list(true);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "persisted");
        assert!(jobs[0].state.next_run_at_ms.is_some(), "next run recomputed");
    }

    #[tokio::test]
    async fn force_run_executes_and_records_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();

        let job = service.add(every_job("runner", 3_600_000)).await.unwrap();
        let output = service.run(&job.id, RunKind::Force).await.unwrap();
        assert_eq!(output.as_deref(), Some("ran"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let settled = service.get(&job.id).unwrap();
        assert_eq!(settled.state.last_status, Some(RunStatus::Ok));
        assert!(settled.state.last_run_at_ms.is_some());
        assert!(settled.state.last_error.is_none());
        assert!(settled.state.running_at_ms.is_none());
    }

    #[tokio::test]
    async fn due_run_skips_future_job() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();

        let job = service.add(every_job("later", 3_600_000)).await.unwrap();
        let output = service.run(&job.id, RunKind::Due).await.unwrap();
        assert!(output.is_none(), "not due yet");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            service.get(&job.id).unwrap().state.last_status,
            Some(RunStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn failed_run_records_error_and_propagates() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = CronService::new(store_path(&dir), failing_executor());
        service.start().await.unwrap();

        let job = service.add(every_job("broken", 3_600_000)).await.unwrap();
        let result = service.run(&job.id, RunKind::Force).await;
        assert!(result.is_err());

        let settled = service.get(&job.id).unwrap();
        assert_eq!(settled.state.last_status, Some(RunStatus::Error));
        assert!(settled.state.last_error.as_deref().unwrap().contains("payload exploded"));
        assert!(settled.state.next_run_at_ms.is_some(), "still rescheduled");
    }

    #[tokio::test]
    async fn delete_after_run_removes_job() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, _count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();

        let mut input = every_job("once", 60_000);
        input.delete_after_run = true;
        let job = service.add(input).await.unwrap();

        service.run(&job.id, RunKind::Force).await.unwrap();
        assert!(
            service.list(true).is_empty(),
            "delete_after_run job is gone even from the full list"
        );
    }

    #[tokio::test]
    async fn delete_after_run_removes_failed_job_too() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = CronService::new(store_path(&dir), failing_executor());
        service.start().await.unwrap();

        let mut input = every_job("once-broken", 60_000);
        input.delete_after_run = true;
        let job = service.add(input).await.unwrap();

        let _ = service.run(&job.id, RunKind::Force).await;
        assert!(service.list(true).is_empty());
    }

    #[tokio::test]
    async fn timer_fires_due_one_shot() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();

        let mut input = CronJobInput::new(
            "soon",
            Schedule::At {
                at_ms: Utc::now().timestamp_millis() + 50,
            },
            Payload::SystemEvent {
                text: "fire".to_owned(),
            },
        );
        input.delete_after_run = true;
        service.add(input).await.unwrap();

        for _ in 0..100 {
            if count.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1, "timer fired once");
        assert!(service.list(true).is_empty());
    }

    #[tokio::test]
    async fn events_are_emitted() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, _count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();
        let mut events = service.subscribe();

        let job = service.add(every_job("observed", 3_600_000)).await.unwrap();
        service.run(&job.id, RunKind::Force).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, CronEventKind::Run);
        assert_eq!(event.result.as_deref(), Some("ran"));
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, _count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();
        let result = service.update("missing", CronJobPatch::default()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_interval_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let (executor, _count) = counting_executor();
        let service = CronService::new(store_path(&dir), executor);
        service.start().await.unwrap();
        let result = service.add(every_job("zero", 0)).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn next_run_overdue_at_gets_grace() {
        let now = 1_000_000;
        let next = compute_next_run(&Schedule::At { at_ms: now - 5_000 }, now);
        assert_eq!(next, now + OVERDUE_GRACE_MS);

        let future = compute_next_run(&Schedule::At { at_ms: now + 5_000 }, now);
        assert_eq!(future, now + 5_000);
    }

    #[test]
    fn next_run_every_aligns_to_anchor() {
        // anchor at t=0, every 60s, now 130s → next at 180s.
        let next = compute_next_run(
            &Schedule::Every {
                every_ms: 60_000,
                anchor_ms: Some(0),
            },
            130_000,
        );
        assert_eq!(next, 180_000);

        // now before the anchor → first fire lands on the anchor itself.
        let before = compute_next_run(
            &Schedule::Every {
                every_ms: 60_000,
                anchor_ms: Some(200_000),
            },
            130_000,
        );
        assert_eq!(before, 200_000);
    }

    #[test]
    fn next_run_cron_five_field() {
        let now = Utc::now().timestamp_millis();
        let next = compute_next_run(
            &Schedule::Cron {
                expr: "* * * * *".to_owned(),
                tz: None,
            },
            now,
        );
        assert!(next > now, "every-minute cron fires in the future");
        assert!(next <= now + 61_000);
    }

    #[test]
    fn next_run_bad_cron_retries_in_a_minute() {
        let now = 1_000_000;
        let next = compute_next_run(
            &Schedule::Cron {
                expr: "not a cron expression".to_owned(),
                tz: None,
            },
            now,
        );
        assert_eq!(next, now + BAD_CRON_RETRY_MS);
    }
}
