//! Run lifecycle orchestration: parent/child creation, fan-out, and
//! completion aggregation.
//!
//! Parent completion is driven by invocation at each child terminal
//! transition, not by a coordinator thread: child completions arrive as
//! independent queue callbacks, so `check_parent_completion` is written to
//! be idempotent and race-free. The actual terminal write is a single
//! conditional update at the storage layer (`finalize_parent`), which is
//! what keeps two near-simultaneous completions from double-finalizing.

use std::sync::Arc;

use tracing::info;

use crate::db::{DbHandle, NewRun};
use crate::errors::OrchestratorError;
use crate::models::*;
use crate::queue::QueueDispatcher;

/// How a cancelled child counts toward parent aggregation. The source
/// behavior is ambiguous here, so the policy is explicit: by default a
/// cancelled child is terminal but not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelledPolicy {
    #[default]
    NotFailed,
    CountsAsFailed,
}

/// Input for `create_parent_run`.
#[derive(Debug, Clone)]
pub struct CreateParentRun {
    pub tenant_id: i64,
    pub project_id: i64,
    pub ticket_id: Option<i64>,
    pub provider: AgentProvider,
    pub mode: AgentMode,
    pub prompt: String,
    pub resolved_prompt: String,
    pub orchestration_mode: OrchestrationMode,
}

/// One unit of a fan-out: a prompt plus an optional repository scope.
#[derive(Debug, Clone)]
pub struct SubTask {
    pub prompt: String,
    pub resolved_prompt: String,
    pub repo: Option<RepoSpec>,
}

/// A run and its direct children.
#[derive(Debug, Clone)]
pub struct RunHierarchy {
    pub parent: Run,
    pub children: Vec<Run>,
}

pub struct Orchestrator {
    db: DbHandle,
    dispatcher: Arc<QueueDispatcher>,
    cancelled_policy: CancelledPolicy,
}

impl Orchestrator {
    pub fn new(db: DbHandle, dispatcher: Arc<QueueDispatcher>) -> Self {
        Self {
            db,
            dispatcher,
            cancelled_policy: CancelledPolicy::default(),
        }
    }

    pub fn with_cancelled_policy(mut self, policy: CancelledPolicy) -> Self {
        self.cancelled_policy = policy;
        self
    }

    /// Insert a parent run in `queued`. No side effects beyond persistence;
    /// dispatch happens in `fan_out_sub_runs` (or directly for runs without
    /// children).
    pub async fn create_parent_run(
        &self,
        input: CreateParentRun,
    ) -> Result<Run, OrchestratorError> {
        let new = NewRun {
            tenant_id: input.tenant_id,
            project_id: input.project_id,
            ticket_id: input.ticket_id,
            provider: input.provider,
            mode: input.mode,
            input_prompt: input.prompt,
            resolved_prompt: Some(input.resolved_prompt),
            parent_run_id: None,
            orchestration_mode: Some(input.orchestration_mode),
        };
        let run = self.db.call(move |db| db.create_run(&new)).await?;
        info!(
            run_id = run.id,
            orchestration_mode = %input.orchestration_mode,
            "parent run created"
        );
        Ok(run)
    }

    /// Create one child run per subtask and enqueue each under the
    /// idempotency key `run-<childId>`, so re-submitting a child id never
    /// produces duplicate in-flight work.
    ///
    /// An enqueue failure propagates to the caller; the child rows already
    /// created stay `queued` with no job, to be re-enqueued by an external
    /// reconciliation sweep or a full retry of the creation.
    pub async fn fan_out_sub_runs(
        &self,
        tenant_id: i64,
        parent_run_id: i64,
        provider: AgentProvider,
        mode: AgentMode,
        project_id: i64,
        sub_tasks: Vec<SubTask>,
    ) -> Result<Vec<Run>, OrchestratorError> {
        let parent = self
            .get_run(parent_run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound { id: parent_run_id })?;
        if parent.parent_run_id.is_some() {
            return Err(OrchestratorError::NestedFanOut { id: parent_run_id });
        }

        let mut child_runs = Vec::with_capacity(sub_tasks.len());
        for task in sub_tasks {
            let new = NewRun {
                tenant_id,
                project_id,
                ticket_id: None,
                provider,
                mode,
                input_prompt: task.prompt.clone(),
                resolved_prompt: Some(task.resolved_prompt.clone()),
                parent_run_id: Some(parent_run_id),
                orchestration_mode: None,
            };
            let run = self.db.call(move |db| db.create_run(&new)).await?;

            let payload = JobPayload {
                run_id: run.id,
                tenant_id,
                project_id,
                ticket_id: None,
                provider,
                mode,
                resolved_prompt: task.resolved_prompt,
                input_prompt: task.prompt,
                repo: task.repo,
                repos: None,
                constraints: None,
                images: None,
                parent_run_id: Some(parent_run_id),
            };
            self.dispatcher.dispatch(&payload).await?;

            child_runs.push(run);
        }

        info!(
            parent_run_id,
            child_count = child_runs.len(),
            "sub-runs fanned out"
        );
        Ok(child_runs)
    }

    /// Aggregate child terminal statuses into the parent. Returns `true`
    /// once all children are terminal (whether or not this particular call
    /// performed the finalizing write).
    ///
    /// Safe to call concurrently from every completing child: the terminal
    /// write is conditional on the parent not already being terminal, so
    /// recomputing and rewriting the same status is harmless and a
    /// finalized parent is never flipped.
    pub async fn check_parent_completion(
        &self,
        parent_run_id: i64,
    ) -> Result<bool, OrchestratorError> {
        let children = self.list_child_runs(parent_run_id).await?;

        // A run with no children completes via its own direct status.
        if children.is_empty() {
            return Ok(false);
        }
        if children.iter().any(|c| !c.status.is_terminal()) {
            return Ok(false);
        }

        let any_failed = children.iter().any(|c| match c.status {
            RunStatus::Failed => true,
            RunStatus::Cancelled => self.cancelled_policy == CancelledPolicy::CountsAsFailed,
            _ => false,
        });
        let final_status = if any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let finalized = self
            .db
            .call(move |db| db.finalize_parent(parent_run_id, final_status))
            .await?;
        if finalized {
            info!(
                parent_run_id,
                final_status = %final_status,
                child_count = children.len(),
                "parent run completed"
            );
        }
        Ok(true)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<Run>, OrchestratorError> {
        Ok(self.db.call(move |db| db.get_run(run_id)).await?)
    }

    pub async fn get_run_hierarchy(
        &self,
        run_id: i64,
    ) -> Result<Option<RunHierarchy>, OrchestratorError> {
        let Some(parent) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let children = self.list_child_runs(run_id).await?;
        Ok(Some(RunHierarchy { parent, children }))
    }

    pub async fn list_child_runs(
        &self,
        parent_run_id: i64,
    ) -> Result<Vec<Run>, OrchestratorError> {
        Ok(self
            .db
            .call(move |db| db.list_child_runs(parent_run_id))
            .await?)
    }

    /// Create the per-repository association rows for a run scoped to one
    /// or more repositories.
    pub async fn create_run_repos(
        &self,
        tenant_id: i64,
        run_id: i64,
        repos: &[RepoSpec],
    ) -> Result<Vec<RunRepo>, OrchestratorError> {
        let rows: Vec<(i64, String)> = repos
            .iter()
            .map(|r| (r.repository_id, r.work_branch().to_string()))
            .collect();
        let created = self
            .db
            .call(move |db| db.create_run_repos(tenant_id, run_id, &rows))
            .await?;
        info!(run_id, repo_count = created.len(), "run repos created");
        Ok(created)
    }

    pub async fn list_run_repos(&self, run_id: i64) -> Result<Vec<RunRepo>, OrchestratorError> {
        Ok(self.db.call(move |db| db.list_run_repos(run_id)).await?)
    }
}
