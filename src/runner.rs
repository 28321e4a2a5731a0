//! Process-backed agent sessions.
//!
//! `ProcessRunner` spawns a provider CLI per session, hands it the payload
//! and compacted context as JSON on stdin, and streams stdout back line by
//! line. Lines that parse as tagged event JSON are emitted as-is; anything
//! else becomes a `log` event, so a chatty agent still produces a usable
//! event history.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::compaction::{ChatMessage, estimate_tokens};
use crate::engine::{AgentRunner, RunOutput};
use crate::events::{AgentEvent, EventEmitter};
use crate::models::JobPayload;

/// Wire shape written to the agent process stdin.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInput<'a> {
    payload: &'a JobPayload,
    context: &'a [ChatMessage],
}

pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
}

impl ProcessRunner {
    /// Build from a whitespace-separated command line, e.g. `"claude -p"`.
    pub fn new(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().context("Empty agent command")?.to_string();
        Ok(Self {
            program,
            args: parts.map(String::from).collect(),
        })
    }

    /// Parse one stdout line into an event.
    ///
    /// Priority order:
    /// 1. JSON object carrying a known `type` tag → that event, verbatim
    /// 2. Anything else non-empty → `log` with the raw text
    pub fn parse_line(line: &str) -> Option<AgentEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('{') {
            if let Ok(event) = serde_json::from_str::<AgentEvent>(trimmed) {
                return Some(event);
            }
        }
        Some(AgentEvent::Log {
            text: trimmed.to_string(),
        })
    }
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn execute(
        &self,
        payload: &JobPayload,
        context: Vec<ChatMessage>,
        emitter: &EventEmitter,
    ) -> Result<RunOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent process '{}'", self.program))?;

        let input = serde_json::to_vec(&SessionInput {
            payload,
            context: &context,
        })
        .context("Failed to serialize session input")?;
        let mut stdin = child.stdin.take().context("Agent stdin unavailable")?;
        let writer_task = tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });

        if let Some(stderr) = child.stderr.take() {
            let run_id = emitter.run_id();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(run_id, line, "agent stderr");
                }
            });
        }

        let stdout = child.stdout.take().context("Agent stdout unavailable")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut summary = None;
        let mut emitted_tokens = 0i64;
        while let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read agent output")?
        {
            let Some(event) = Self::parse_line(&line) else {
                continue;
            };
            emitted_tokens += estimate_tokens(event.content_text()) as i64;
            if let AgentEvent::Message { text, .. } = &event {
                summary = Some(text.clone());
            }
            emitter.emit(event).await?;
        }

        let _ = writer_task.await;
        let status = child
            .wait()
            .await
            .context("Failed to wait for agent process")?;
        if !status.success() {
            anyhow::bail!("agent process exited with {}", status);
        }

        Ok(RunOutput {
            summary,
            cost_cents: 0,
            tokens_used: emitted_tokens,
        })
    }
}
