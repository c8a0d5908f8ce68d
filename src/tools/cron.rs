//! Agent-initiated scheduling tools.
//!
//! `cron_schedule` registers a job, `cron_list` shows the registry, and
//! `cron_cancel` removes a job. All three are withheld from subagents.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use crate::cron::{CronJobInput, CronService, Payload, Schedule};

use super::{Tool, ToolResult};

// ─── CronScheduleTool ────────────────────────────────────────────────────────

/// Agent tool: schedule a one-shot or recurring job.
pub struct CronScheduleTool {
    service: Arc<CronService>,
}

impl CronScheduleTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self { service }
    }

    fn parse_schedule(args: &Value) -> Result<Schedule, String> {
        let schedule = args
            .get("schedule")
            .ok_or("missing required argument 'schedule'")?;
        let schedule_type = schedule
            .get("type")
            .and_then(Value::as_str)
            .ok_or("schedule must have a 'type' field")?;
        match schedule_type {
            "at" => {
                let at_ms = match schedule.get("at_ms").and_then(Value::as_i64) {
                    Some(at_ms) => at_ms,
                    None => {
                        let in_seconds = schedule
                            .get("in_seconds")
                            .and_then(Value::as_i64)
                            .ok_or("'at' schedule requires 'at_ms' or 'in_seconds'")?;
                        Utc::now().timestamp_millis() + in_seconds * 1000
                    }
                };
                Ok(Schedule::At { at_ms })
            }
            "every" => {
                let every_seconds = schedule
                    .get("every_seconds")
                    .and_then(Value::as_i64)
                    .ok_or("'every' schedule requires 'every_seconds'")?;
                Ok(Schedule::Every {
                    every_ms: every_seconds * 1000,
                    anchor_ms: schedule.get("anchor_ms").and_then(Value::as_i64),
                })
            }
            "cron" => {
                let expr = schedule
                    .get("expr")
                    .and_then(Value::as_str)
                    .ok_or("'cron' schedule requires 'expr'")?
                    .to_owned();
                Ok(Schedule::Cron {
                    expr,
                    tz: schedule.get("tz").and_then(Value::as_str).map(str::to_owned),
                })
            }
            other => Err(format!(
                "unknown schedule type '{other}': expected 'at', 'every', or 'cron'"
            )),
        }
    }

    fn parse_payload(args: &Value) -> Result<Payload, String> {
        if let Some(prompt) = args.get("prompt").and_then(Value::as_str) {
            return Ok(Payload::AgentTurn {
                message: prompt.to_owned(),
                deliver: args.get("deliver").and_then(Value::as_bool),
                channel: args.get("channel").and_then(Value::as_str).map(str::to_owned),
                chat_id: args.get("chat_id").and_then(Value::as_str).map(str::to_owned),
            });
        }
        if let Some(text) = args.get("event_text").and_then(Value::as_str) {
            return Ok(Payload::SystemEvent {
                text: text.to_owned(),
            });
        }
        Err("either 'prompt' (agent turn) or 'event_text' (system event) is required".to_owned())
    }
}

#[async_trait]
impl Tool for CronScheduleTool {
    fn name(&self) -> &str {
        "cron_schedule"
    }

    fn description(&self) -> &str {
        "Schedule a prompt or system event to run later: once at a timestamp, \
         on a fixed interval, or on a 5-field cron expression \
         (e.g. '0 9 * * *' for daily at 9:00 UTC)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["schedule"],
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Human-readable job name."
                },
                "schedule": {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "type": {"type": "string", "enum": ["at", "every", "cron"]},
                        "at_ms": {"type": "integer", "description": "Epoch ms (for 'at')."},
                        "in_seconds": {"type": "integer", "description": "Delay from now (for 'at')."},
                        "every_seconds": {"type": "integer", "description": "Interval (for 'every')."},
                        "expr": {"type": "string", "description": "5-field cron expression (for 'cron')."}
                    }
                },
                "prompt": {
                    "type": "string",
                    "description": "Run this prompt as an agent turn when the job fires."
                },
                "event_text": {
                    "type": "string",
                    "description": "Publish this system event instead of running a turn."
                },
                "deliver": {
                    "type": "boolean",
                    "description": "Deliver the turn's reply to the requesting channel."
                },
                "delete_after_run": {
                    "type": "boolean",
                    "description": "Remove the job after its first execution."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let schedule = Self::parse_schedule(&args)?;
        let payload = Self::parse_payload(&args)?;
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| "agent-job".to_owned());

        let mut input = CronJobInput::new(name, schedule, payload);
        input.delete_after_run = args
            .get("delete_after_run")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let job = self.service.add(input).await.map_err(|e| e.to_string())?;
        Ok(ToolResult::ok(format!(
            "Scheduled job '{}' with id {}",
            job.name, job.id
        ))
        .with_metadata(json!({"job_id": job.id})))
    }
}

// ─── CronListTool ────────────────────────────────────────────────────────────

/// Agent tool: list scheduled jobs.
pub struct CronListTool {
    service: Arc<CronService>,
}

impl CronListTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for CronListTool {
    fn name(&self) -> &str {
        "cron_list"
    }

    fn description(&self) -> &str {
        "List scheduled jobs with their next run time and last status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "include_disabled": {
                    "type": "boolean",
                    "description": "Also show disabled jobs."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let include_disabled = args
            .get("include_disabled")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let jobs = self.service.list(include_disabled);
        if jobs.is_empty() {
            return Ok(ToolResult::ok("No scheduled jobs.").with_metadata(json!({"count": 0})));
        }
        let lines: Vec<String> = jobs
            .iter()
            .map(|j| {
                let next = j
                    .state
                    .next_run_at_ms
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "pending".to_owned());
                let status = j
                    .state
                    .last_status
                    .map(|s| format!("{s:?}").to_lowercase())
                    .unwrap_or_else(|| "never".to_owned());
                format!("{:<36} {:<20} {:<8} next: {}", j.id, j.name, status, next)
            })
            .collect();
        let count = jobs.len();
        Ok(ToolResult::ok(lines.join("\n")).with_metadata(json!({"count": count})))
    }
}

// ─── CronCancelTool ──────────────────────────────────────────────────────────

/// Agent tool: remove a scheduled job.
pub struct CronCancelTool {
    service: Arc<CronService>,
}

impl CronCancelTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for CronCancelTool {
    fn name(&self) -> &str {
        "cron_cancel"
    }

    fn description(&self) -> &str {
        "Cancel a scheduled job by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["job_id"],
            "properties": {
                "job_id": {"type": "string", "description": "Id of the job to remove."}
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let job_id = args
            .get("job_id")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'job_id'")?;
        match self.service.remove(job_id).await {
            Ok(()) => Ok(ToolResult::ok(format!("Cancelled job {job_id}."))),
            Err(crate::error::Error::NotFound(_)) => {
                Ok(ToolResult::err(format!("No job with id {job_id}.")))
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
