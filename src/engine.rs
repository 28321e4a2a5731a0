//! Worker-side execution engine: drives one job payload to a terminal
//! outcome, emitting events throughout.
//!
//! The concrete AI agent is a black box behind the `AgentRunner` trait;
//! the engine owns everything around it: payload validation, sandbox
//! delegation, the sequential multi-repository loop, context compaction
//! before each provider call, and terminal run bookkeeping. No failure
//! escapes `process` as a panic; a failed job becomes a `failed` run with
//! an `error` event.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::compaction::{ChatMessage, compact_messages};
use crate::db::DbHandle;
use crate::errors::EngineError;
use crate::events::{AgentEvent, EventEmitter, EventPipeline, MessageRole};
use crate::models::{JobPayload, RepoSpec, RepoStatus, RunStatus};
use crate::sandbox;

/// What the black-box agent produced for one session.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub summary: Option<String>,
    pub cost_cents: i64,
    pub tokens_used: i64,
}

/// Abstraction over one agent session for testability.
/// Real implementations shell out to a provider; tests use scripted doubles.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Execute one session against the (compacted) conversation context.
    /// Progress is reported through the emitter; the return value carries
    /// only the terminal accounting.
    async fn execute(
        &self,
        payload: &JobPayload,
        context: Vec<ChatMessage>,
        emitter: &EventEmitter,
    ) -> Result<RunOutput>;
}

/// External launcher for sandboxed execution. Receives the base64-encoded
/// payload and stands up an isolated context that behaves identically to
/// in-process execution, including owning its own event pipeline handle.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(&self, encoded_payload: &str) -> Result<()>;
}

/// What `process` did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Handed to the sandbox launcher; the sandboxed process owns all
    /// further status changes and events.
    Delegated,
    /// Executed in-process to the given terminal status.
    Finished(RunStatus),
}

pub struct ExecutionEngine {
    db: DbHandle,
    pipeline: Arc<EventPipeline>,
    runner: Arc<dyn AgentRunner>,
    launcher: Option<Arc<dyn SandboxLauncher>>,
    max_context_tokens: u64,
}

impl ExecutionEngine {
    pub fn new(
        db: DbHandle,
        pipeline: Arc<EventPipeline>,
        runner: Arc<dyn AgentRunner>,
        max_context_tokens: u64,
    ) -> Self {
        Self {
            db,
            pipeline,
            runner,
            launcher: None,
            max_context_tokens,
        }
    }

    /// Enable sandbox delegation. With a launcher set, `process` hands every
    /// payload off instead of executing in-process.
    pub fn with_launcher(mut self, launcher: Arc<dyn SandboxLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Drive one payload to its outcome.
    pub async fn process(&self, payload: &JobPayload) -> Result<EngineOutcome, EngineError> {
        if payload.repo.is_some() && payload.is_multi_repo() {
            return Err(EngineError::MalformedPayload(
                "payload has both repo and repos populated".to_string(),
            ));
        }

        if let Some(launcher) = &self.launcher {
            let encoded = sandbox::encode_payload(payload)?;
            info!(run_id = payload.run_id, "delegating job to sandbox launcher");
            launcher
                .launch(&encoded)
                .await
                .map_err(EngineError::SandboxLaunch)?;
            return Ok(EngineOutcome::Delegated);
        }

        let run_id = payload.run_id;
        let started = self.db.call(move |db| db.mark_running(run_id)).await?;
        if !started {
            // Duplicate delivery of a job whose run already progressed.
            warn!(run_id, "run not in queued state; skipping execution");
            let run = self.db.call(move |db| db.get_run(run_id)).await?;
            let status = run.map(|r| r.status).unwrap_or(RunStatus::Failed);
            return Ok(EngineOutcome::Finished(status));
        }

        let emitter = EventEmitter::new(self.pipeline.clone(), payload.tenant_id, run_id);
        let result = if payload.is_multi_repo() {
            self.run_multi_repo(payload, &emitter).await
        } else {
            self.run_single(payload, &emitter).await
        };

        let status = match result {
            Ok(output) => {
                let (cost, tokens) = (output.cost_cents, output.tokens_used);
                self.db
                    .call(move |db| db.record_usage(run_id, cost, tokens))
                    .await?;
                let summary = output.summary;
                self.db
                    .call(move |db| db.finish_run(run_id, RunStatus::Completed, summary.as_deref()))
                    .await?;
                info!(run_id, "run completed");
                RunStatus::Completed
            }
            Err(err) => {
                error!(run_id, error = %err, "run failed");
                if let Err(emit_err) = emitter
                    .emit(AgentEvent::Error {
                        message: err.to_string(),
                        stack: None,
                    })
                    .await
                {
                    warn!(run_id, error = %emit_err, "failed to emit error event");
                }
                let message = err.to_string();
                self.db
                    .call(move |db| db.finish_run(run_id, RunStatus::Failed, Some(&message)))
                    .await?;
                RunStatus::Failed
            }
        };

        Ok(EngineOutcome::Finished(status))
    }

    /// One full agent session: compact the accumulated context, then invoke
    /// the black-box runner.
    async fn run_single(
        &self,
        payload: &JobPayload,
        emitter: &EventEmitter,
    ) -> Result<RunOutput> {
        let context = self.compacted_context(payload, emitter).await?;
        self.runner
            .execute(payload, context, emitter)
            .await
            .context("Agent session failed")
    }

    /// Sequential per-repository loop. A failing repository gets a scoped
    /// `error` event and the loop moves on; siblings are always attempted.
    /// The run itself fails only when every repository failed.
    async fn run_multi_repo(
        &self,
        payload: &JobPayload,
        emitter: &EventEmitter,
    ) -> Result<RunOutput> {
        let repos: &[RepoSpec] = match &payload.repos {
            Some(repos) if !repos.is_empty() => repos,
            _ => {
                emitter
                    .emit(AgentEvent::Error {
                        message: "No repositories specified for multi-repo run".to_string(),
                        stack: None,
                    })
                    .await?;
                return Err(anyhow!("no repositories specified for multi-repo run"));
            }
        };

        info!(
            run_id = payload.run_id,
            repo_count = repos.len(),
            "starting multi-repo run"
        );
        emitter
            .emit(AgentEvent::Message {
                role: MessageRole::System,
                text: format!(
                    "Starting multi-repo run across {} repositories",
                    repos.len()
                ),
            })
            .await?;

        let mut total = RunOutput::default();
        let mut succeeded = 0usize;
        for repo in repos {
            emitter
                .emit(AgentEvent::Log {
                    text: format!(
                        "Processing repository: {} (branch: {})",
                        repo.clone_url,
                        repo.work_branch()
                    ),
                })
                .await?;
            self.set_repo_status(payload.run_id, repo.repository_id, RepoStatus::Running, None)
                .await?;

            let scoped = payload.for_repo(repo);
            match self.run_single(&scoped, emitter).await {
                Ok(output) => {
                    succeeded += 1;
                    total.cost_cents += output.cost_cents;
                    total.tokens_used += output.tokens_used;
                    self.set_repo_status(
                        payload.run_id,
                        repo.repository_id,
                        RepoStatus::Succeeded,
                        output.summary.as_deref(),
                    )
                    .await?;
                }
                Err(err) => {
                    error!(
                        run_id = payload.run_id,
                        repository_id = repo.repository_id,
                        error = %err,
                        "multi-repo run failed for repo"
                    );
                    emitter
                        .emit(AgentEvent::Error {
                            message: format!("Failed for repository {}: {}", repo.clone_url, err),
                            stack: None,
                        })
                        .await?;
                    self.set_repo_status(
                        payload.run_id,
                        repo.repository_id,
                        RepoStatus::Failed,
                        None,
                    )
                    .await?;
                }
            }
        }

        emitter
            .emit(AgentEvent::Message {
                role: MessageRole::System,
                text: format!(
                    "Multi-repo run completed across {} repositories",
                    repos.len()
                ),
            })
            .await?;

        if succeeded == 0 {
            return Err(anyhow!("all {} repositories failed", repos.len()));
        }
        total.summary = Some(format!(
            "{}/{} repositories succeeded",
            succeeded,
            repos.len()
        ));
        Ok(total)
    }

    /// Build the conversation context for a session: the resolved prompt as
    /// system content plus the run's accumulated message/log history, then
    /// compact it to the token budget. A firing compaction emits its event
    /// and stamps `compacted_at`.
    async fn compacted_context(
        &self,
        payload: &JobPayload,
        emitter: &EventEmitter,
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = vec![ChatMessage::system(payload.resolved_prompt.clone())];
        for stored in self.pipeline.replay(payload.run_id).await? {
            match stored.event()? {
                AgentEvent::Message { role, text } => {
                    messages.push(ChatMessage { role, content: text });
                }
                AgentEvent::Log { text } => messages.push(ChatMessage::assistant(text)),
                _ => {}
            }
        }

        let (compacted, report) = compact_messages(messages, self.max_context_tokens);
        if let Some(report) = report {
            info!(
                run_id = payload.run_id,
                tokens_before = report.tokens_before,
                tokens_after = report.tokens_after,
                "context compacted"
            );
            emitter
                .emit(AgentEvent::Compaction {
                    tokens_before: report.tokens_before,
                    tokens_after: report.tokens_after,
                    summary: report.summary(),
                })
                .await?;
            let run_id = payload.run_id;
            self.db.call(move |db| db.mark_compacted(run_id)).await?;
        }
        Ok(compacted)
    }

    async fn set_repo_status(
        &self,
        run_id: i64,
        repository_id: i64,
        status: RepoStatus,
        diff_summary: Option<&str>,
    ) -> Result<()> {
        let summary = diff_summary.map(str::to_string);
        self.db
            .call(move |db| {
                db.update_repo_status(run_id, repository_id, status, summary.as_deref())
            })
            .await?;
        Ok(())
    }
}
