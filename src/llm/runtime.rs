//! OpenAI-compatible chat runtime.
//!
//! [`ChatRuntime`] implements [`SessionFactory`] against any
//! OpenAI-compatible chat-completions endpoint (OpenAI, OpenRouter, Groq,
//! Ollama, …). Each session keeps its conversation in memory, mirrors every
//! turn to `<sessionDirectory>/history.jsonl`, and resumes that file when a
//! session is recreated over the same directory.
//!
//! # Tool calls
//! Tools are offered to the model through a system preamble; the model
//! invokes them by embedding either of two formats in its reply:
//!
//! ```text
//! <tool_call>{"name": "recall", "arguments": {"query": "deploy"}}</tool_call>
//! ```
//!
//! or a JSON object whose body is `{"tool_calls": [{"function": {...}}]}`.
//! Tool results are fed back as user messages and the loop continues, bounded
//! by `max_iterations`.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write as _,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::{
    config::provider_base_url,
    error::{Error, Result},
    tools::Tool,
};

use super::{AgentSession, ContextUsage, SessionConfig, SessionFactory};

const HISTORY_FILE: &str = "history.jsonl";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_ITERATIONS: usize = 16;
const DEFAULT_CONTEXT_LIMIT: usize = 128_000;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

// ─── ChatRuntime ─────────────────────────────────────────────────────────────

/// Session factory over an OpenAI-compatible endpoint.
pub struct ChatRuntime {
    client: reqwest::Client,
    /// Endpoint override; `None` resolves from the provider registry.
    base_url: Option<String>,
    max_iterations: usize,
    context_limit: usize,
}

impl ChatRuntime {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// Point the runtime at a custom endpoint (e.g. a local Ollama).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_context_limit(mut self, context_limit: usize) -> Self {
        self.context_limit = context_limit;
        self
    }
}

impl Default for ChatRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for ChatRuntime {
    async fn create_session(&self, config: SessionConfig) -> Result<Arc<dyn AgentSession>> {
        let base_url = match self.base_url.clone() {
            Some(url) => url,
            None => provider_base_url(&config.provider)
                .ok_or_else(|| {
                    Error::validation(format!("unknown provider '{}'", config.provider))
                })?
                .to_owned(),
        };
        let api_key = Zeroizing::new(
            config
                .auth_store
                .get(&config.provider)
                .unwrap_or_default()
                .to_owned(),
        );

        fs::create_dir_all(&config.session_directory)?;
        let history_path = config.session_directory.join(HISTORY_FILE);
        let history = load_history(&history_path)?;
        let resumed = !history.is_empty();

        let tools: HashMap<String, Arc<dyn Tool>> = config
            .custom_tools
            .iter()
            .map(|t| (t.name().to_owned(), Arc::clone(t)))
            .collect();

        if resumed {
            log::debug!(
                "[runtime] resuming session from {} ({} messages)",
                history_path.display(),
                history.len()
            );
        }
        Ok(Arc::new(RuntimeSession {
            client: self.client.clone(),
            base_url,
            api_key,
            model: config.model,
            tools,
            history_path,
            history: Mutex::new(history),
            last_total_tokens: AtomicU64::new(0),
            max_iterations: self.max_iterations,
            context_limit: self.context_limit,
        }))
    }
}

// ─── RuntimeSession ──────────────────────────────────────────────────────────

struct RuntimeSession {
    client: reqwest::Client,
    base_url: String,
    api_key: Zeroizing<String>,
    model: String,
    tools: HashMap<String, Arc<dyn Tool>>,
    history_path: PathBuf,
    history: Mutex<Vec<ApiMessage>>,
    last_total_tokens: AtomicU64,
    max_iterations: usize,
    context_limit: usize,
}

#[async_trait]
impl AgentSession for RuntimeSession {
    async fn prompt(&self, text: &str) -> Result<()> {
        let mut messages = self.snapshot();
        let mut appended = Vec::new();

        let user = ApiMessage {
            role: "user".to_owned(),
            content: text.to_owned(),
        };
        messages.push(user.clone());
        appended.push(user);

        for _ in 0..self.max_iterations {
            let reply = self.complete(&messages).await?;
            let assistant = ApiMessage {
                role: "assistant".to_owned(),
                content: reply,
            };
            messages.push(assistant.clone());
            appended.push(assistant.clone());

            let calls = parse_tool_calls(&assistant.content);
            if calls.is_empty() {
                break;
            }
            for call in calls {
                let result = self.execute_tool(&call).await;
                let feedback = ApiMessage {
                    role: "user".to_owned(),
                    content: format!("[tool result: {}]\n{}", call.name, result),
                };
                messages.push(feedback.clone());
                appended.push(feedback);
            }
        }

        self.commit(appended)?;
        Ok(())
    }

    fn last_assistant_text(&self) -> Option<String> {
        self.snapshot()
            .iter()
            .rev()
            .find(|m| m.role == "assistant")
            .map(|m| m.content.clone())
    }

    fn context_usage(&self) -> Option<ContextUsage> {
        let tokens = self.last_total_tokens.load(Ordering::SeqCst);
        if tokens == 0 {
            return None;
        }
        Some(ContextUsage {
            percent: tokens as f64 / self.context_limit as f64,
        })
    }
}

impl RuntimeSession {
    async fn complete(&self, history: &[ApiMessage]) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !self.tools.is_empty() {
            messages.push(ApiMessage {
                role: "system".to_owned(),
                content: tool_preamble(&self.tools),
            });
        }
        messages.extend_from_slice(history);

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
        };
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(DEFAULT_TIMEOUT)
            .json(&request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(self.api_key.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::runtime(format!(
                "chat completion failed with {status}: {body}"
            )));
        }
        let parsed: ChatCompletionResponse = response.json().await?;
        if let Some(usage) = parsed.usage {
            self.last_total_tokens
                .store(usage.total_tokens, Ordering::SeqCst);
        }
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::runtime("chat completion returned no choices"))
    }

    async fn execute_tool(&self, call: &ParsedToolCall) -> String {
        let Some(tool) = self.tools.get(&call.name) else {
            return format!("error: unknown tool '{}'", call.name);
        };
        match tool.execute(call.arguments.clone()).await {
            Ok(result) if result.success => result.output,
            Ok(result) => format!("error: {}", result.output),
            Err(e) => format!("error: {e}"),
        }
    }

    fn snapshot(&self) -> Vec<ApiMessage> {
        match self.history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Append the turn's messages to memory and to the history file.
    fn commit(&self, appended: Vec<ApiMessage>) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)?;
        for message in &appended {
            writeln!(file, "{}", serde_json::to_string(message)?)?;
        }
        match self.history.lock() {
            Ok(mut guard) => guard.extend(appended),
            Err(poisoned) => poisoned.into_inner().extend(appended),
        }
        Ok(())
    }
}

fn load_history(path: &PathBuf) -> Result<Vec<ApiMessage>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };
    let mut history = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ApiMessage>(line) {
            Ok(message) => history.push(message),
            Err(e) => log::warn!("[runtime] skipping malformed history line: {e}"),
        }
    }
    Ok(history)
}

fn tool_preamble(tools: &HashMap<String, Arc<dyn Tool>>) -> String {
    let mut names: Vec<&String> = tools.keys().collect();
    names.sort();
    let listing: Vec<String> = names
        .iter()
        .map(|name| {
            let tool = &tools[name.as_str()];
            format!(
                "- {}: {}\n  parameters: {}",
                tool.name(),
                tool.description(),
                tool.parameters_schema()
            )
        })
        .collect();
    format!(
        "You can call the following tools. To call one, reply with\n\
         <tool_call>{{\"name\": \"<tool>\", \"arguments\": {{…}}}}</tool_call>\n\
         and wait for the result before answering.\n\n{}",
        listing.join("\n")
    )
}

// ─── Tool-call parsing ───────────────────────────────────────────────────────

/// A tool invocation extracted from an assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Parse every tool call in `content`: a whole-body JSON envelope with a
/// `tool_calls` array, falling back to inline `<tool_call>` tags. Returns an
/// empty list when neither form is present.
pub fn parse_tool_calls(content: &str) -> Vec<ParsedToolCall> {
    if let Some(calls) = try_parse_envelope(content)
        && !calls.is_empty()
    {
        return calls;
    }
    parse_inline(content)
}

fn try_parse_envelope(content: &str) -> Option<Vec<ParsedToolCall>> {
    let body: Value = serde_json::from_str(content.trim()).ok()?;
    let calls = body.get("tool_calls")?.as_array()?;
    let mut parsed = Vec::new();
    for entry in calls {
        let function = entry.get("function")?;
        let name = function.get("name")?.as_str()?.to_owned();
        // `arguments` may be a JSON string (OpenAI) or an inline object.
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) => {
                serde_json::from_str(s).unwrap_or(Value::Object(Default::default()))
            }
            Some(v) => v.clone(),
            None => Value::Object(Default::default()),
        };
        parsed.push(ParsedToolCall { name, arguments });
    }
    Some(parsed)
}

fn parse_inline(content: &str) -> Vec<ParsedToolCall> {
    const OPEN: &str = "<tool_call>";
    const CLOSE: &str = "</tool_call>";

    let mut calls = Vec::new();
    let mut remaining = content;
    while let Some(start) = remaining.find(OPEN) {
        remaining = &remaining[start + OPEN.len()..];
        let Some(end) = remaining.find(CLOSE) else {
            break;
        };
        let body = &remaining[..end];
        remaining = &remaining[end + CLOSE.len()..];
        if let Ok(value) = serde_json::from_str::<Value>(body.trim())
            && let Some(name) = value.get("name").and_then(Value::as_str)
        {
            calls.push(ParsedToolCall {
                name: name.to_owned(),
                arguments: value
                    .get("arguments")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default())),
            });
        }
    }
    calls
}

// ─── Tests ───────────────────────────────────────────────────────────────────
