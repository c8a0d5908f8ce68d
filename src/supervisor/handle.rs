//! Caller-facing handle to one spawned agent.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};

use super::{AgentStatus, Supervisor};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const STATUS_TIMEOUT: Duration = Duration::from_millis(500);

/// Reply from [`AgentHandle::chat`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    response: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client over one agent server, plus teardown operations that reach
/// back into the supervisor.
#[derive(Clone)]
pub struct AgentHandle {
    supervisor: Arc<Supervisor>,
    pub id: String,
    pub port: u16,
    client: reqwest::Client,
}

impl AgentHandle {
    pub(crate) fn new(
        supervisor: Arc<Supervisor>,
        id: String,
        port: u16,
        client: reqwest::Client,
    ) -> Self {
        Self {
            supervisor,
            id,
            port,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    /// Send one chat turn. Omitting `session_id` starts a fresh session;
    /// the reply carries the effective id for follow-up turns.
    pub async fn chat(&self, message: &str, session_id: Option<&str>) -> Result<ChatReply> {
        let mut body = json!({ "message": message });
        if let Some(session_id) = session_id {
            body["session_id"] = json!(session_id);
        }
        let response = self
            .client
            .post(self.url("/chat"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let body: ChatBody = response.json().await?;
            return Ok(ChatReply {
                response: body.response,
                session_id: body.session_id,
            });
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("agent returned {status}"));
        if status.as_u16() == 400 {
            Err(Error::Validation(message))
        } else {
            Err(Error::Runtime(message))
        }
    }

    /// Ping `/health`.
    pub async fn status(&self) -> AgentStatus {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => AgentStatus::Running,
            _ => AgentStatus::Stopped,
        }
    }

    /// Ask the agent to stop; escalate to a termination signal if the
    /// process is still alive after a short grace period.
    pub async fn stop(&self) -> Result<()> {
        let _ = self
            .client
            .post(self.url("/stop"))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;

        let mut alive = true;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.status().await == AgentStatus::Stopped {
                alive = false;
                break;
            }
        }
        if alive && let Some(pid) = self.supervisor.recorded_pid(&self.id).await {
            log::info!(
                "[supervisor] agent '{}' still up; sending SIGTERM to {pid}",
                self.id
            );
            terminate(pid);
        }
        self.supervisor.mark_stopped(&self.id).await;
        Ok(())
    }

    /// Stop the agent and forget it; with `cleanup`, delete its directory.
    pub async fn destroy(&self, cleanup: bool) -> Result<()> {
        self.stop().await?;
        self.supervisor.forget(&self.id, cleanup).await
    }
}

fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .arg(pid.to_string())
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
