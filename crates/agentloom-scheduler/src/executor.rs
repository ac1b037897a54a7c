//! Built-in executors.
//!
//! `NoopExecutor` is what the pool runs when nothing else is wired.
//! `HttpExecutor` hands the task to an external agent backend over HTTP and
//! optionally writes the reply as a markdown artifact in the workspace.

use std::path::PathBuf;
use std::time::Duration;

use agentloom_core::config::ExecutorConfig;
use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::Executor;
use agentloom_core::types::{Task, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub const NOOP_SUMMARY: &str = "processed with default noop executor";
const SUMMARY_LIMIT: usize = 180;

/// Sleeps briefly, then succeeds with a fixed summary.
pub struct NoopExecutor {
    delay: Duration,
}

impl NoopExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for NoopExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(150))
    }
}

#[async_trait]
impl Executor for NoopExecutor {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _task: &Task) -> Result<TaskResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(TaskResult::new(NOOP_SUMMARY))
    }
}

/// Reply accepted from the HTTP backend. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct ExecutorReply {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    artifact_path: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// POSTs the task as JSON to an agent backend.
pub struct HttpExecutor {
    endpoint: String,
    timeout: Duration,
    workspace_root: Option<PathBuf>,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            timeout,
            workspace_root: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = Some(root);
        self
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &ExecutorConfig) -> Option<Self> {
        let endpoint = config.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty())?;
        let mut executor = Self::new(endpoint, Duration::from_secs(config.timeout_secs.max(1)));
        if let Some(root) = config.workspace_root.as_deref().filter(|r| !r.trim().is_empty()) {
            executor = executor.with_workspace_root(PathBuf::from(shellexpand::tilde(root).as_ref()));
        }
        Some(executor)
    }

    /// Write `<root>/<workspace>/tasks/YYYY/MM/DD/<task-id>.md`.
    /// Returns the workspace-relative path, or `None` without a root.
    fn write_artifact(&self, task: &Task, output: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let Some(root) = &self.workspace_root else {
            return Ok(None);
        };
        let workspace = task.workspace_id.trim();
        if workspace.is_empty() {
            return Ok(None);
        }
        let relative = format!("tasks/{}/{}.md", now.format("%Y/%m/%d"), task.id);
        let absolute = root.join(workspace).join(&relative);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LoomError::Execution(format!("create task artifact directory: {e}"))
            })?;
        }
        std::fs::write(&absolute, render_markdown(task, output, now))
            .map_err(|e| LoomError::Execution(format!("write task artifact: {e}")))?;
        tracing::debug!("📝 Task artifact written: {}", absolute.display());
        Ok(Some(relative))
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, task: &Task) -> Result<TaskResult> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(task)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LoomError::Execution(format!("deadline exceeded after {}s", self.timeout.as_secs()))
                } else {
                    LoomError::Execution(format!("executor request failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LoomError::Execution(format!(
                "executor returned {status}: {}",
                summarize_reply(&body)
            )));
        }

        let reply: ExecutorReply = resp
            .json()
            .await
            .map_err(|e| LoomError::Execution(format!("invalid executor reply: {e}")))?;

        let output = reply.output.as_deref().map(str::trim).filter(|o| !o.is_empty());
        let artifact_path = match (reply.artifact_path, output) {
            (Some(path), _) if !path.trim().is_empty() => Some(path),
            (_, Some(output)) => self.write_artifact(task, output, Utc::now())?,
            _ => None,
        };
        let summary = reply
            .summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| summarize_reply(output.unwrap_or_default()));

        Ok(TaskResult {
            summary,
            artifact_path,
            metadata: reply.metadata,
        })
    }
}

/// Whitespace-collapsed, capped at 180 bytes.
pub fn summarize_reply(reply: &str) -> String {
    let text = reply.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return "task completed".into();
    }
    if text.len() <= SUMMARY_LIMIT {
        return text;
    }
    let mut end = SUMMARY_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn render_markdown(task: &Task, output: &str, now: DateTime<Utc>) -> String {
    let mut md = String::from("# Task Result\n\n");
    md.push_str(&format!("- ID: `{}`\n", task.id));
    md.push_str(&format!("- Kind: `{}`\n", task.kind));
    md.push_str(&format!("- Workspace: `{}`\n", task.workspace_id));
    md.push_str(&format!("- Context: `{}`\n", task.context_id));
    md.push_str(&format!("- Title: {}\n", task.title.trim()));
    md.push_str(&format!("- Completed At (UTC): {}\n\n", now.to_rfc3339()));
    md.push_str("## Prompt\n\n");
    md.push_str(task.prompt.trim());
    md.push_str("\n\n## Output\n\n");
    md.push_str(output);
    md.push('\n');
    md
}
