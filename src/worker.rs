//! Queue consumer: pulls payloads off one provider queue and drives each
//! through the execution engine, one job at a time.
//!
//! The worker is the last line of error handling: nothing past enqueue is
//! observable to the submitter except run status and events, so every
//! failure here ends as a `failed` run row, never a propagated error or a
//! crashed loop.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::db::DbHandle;
use crate::engine::{EngineOutcome, ExecutionEngine};
use crate::errors::EngineError;
use crate::events::{AgentEvent, EventPipeline};
use crate::models::{AgentProvider, JobPayload, RunStatus};
use crate::orchestrator::Orchestrator;
use crate::queue::{JobReceiver, QueueDispatcher};

/// Spawn a detached task whose failure is reported through tracing and
/// never propagated to the caller's critical path.
pub fn spawn_reported<F>(name: &'static str, future: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            error!(task = name, error = %err, "background task failed");
        }
    })
}

/// Record an engine-level failure as both an `error` event and a `failed`
/// run row. The engine rejects some payloads before any emitter exists
/// (validation, sandbox launch), so without this path the event log would
/// stay empty on exactly the failures a submitter most needs to see.
async fn report_engine_failure(
    db: &DbHandle,
    pipeline: &EventPipeline,
    payload: &JobPayload,
    err: &EngineError,
) {
    let run_id = payload.run_id;
    error!(run_id, error = %err, "job failed");
    let message = err.to_string();
    if let Err(emit_err) = pipeline
        .emit(
            payload.tenant_id,
            run_id,
            AgentEvent::Error {
                message: message.clone(),
                stack: None,
            },
        )
        .await
    {
        error!(run_id, error = %emit_err, "failed to record error event");
    }
    if let Err(db_err) = db
        .call(move |db| db.finish_run(run_id, RunStatus::Failed, Some(&message)))
        .await
    {
        error!(run_id, error = %db_err, "failed to record job failure");
    }
}

/// Execute one payload delivered through the sandbox hand-off.
///
/// The delegating worker stops at the hand-off, so this side owns the rest
/// of the lifecycle: terminal bookkeeping, failure reporting, and the
/// parent completion check when the payload is a fanned-out child.
pub async fn run_sandboxed_payload(
    db: DbHandle,
    pipeline: &EventPipeline,
    engine: &ExecutionEngine,
    payload: &JobPayload,
) -> Result<()> {
    if let Err(err) = engine.process(payload).await {
        report_engine_failure(&db, pipeline, payload, &err).await;
    }
    if let Some(parent_run_id) = payload.parent_run_id {
        let orchestrator = Orchestrator::new(db, Arc::new(QueueDispatcher::new()));
        if !orchestrator.check_parent_completion(parent_run_id).await? {
            warn!(parent_run_id, "parent not yet complete");
        }
    }
    Ok(())
}

pub struct Worker {
    provider: AgentProvider,
    receiver: JobReceiver,
    engine: Arc<ExecutionEngine>,
    dispatcher: Arc<QueueDispatcher>,
    orchestrator: Arc<Orchestrator>,
    db: DbHandle,
    pipeline: Arc<EventPipeline>,
}

impl Worker {
    pub fn new(
        provider: AgentProvider,
        receiver: JobReceiver,
        engine: Arc<ExecutionEngine>,
        dispatcher: Arc<QueueDispatcher>,
        orchestrator: Arc<Orchestrator>,
        db: DbHandle,
        pipeline: Arc<EventPipeline>,
    ) -> Self {
        Self {
            provider,
            receiver,
            engine,
            dispatcher,
            orchestrator,
            db,
            pipeline,
        }
    }

    /// Consume jobs until ctrl-c.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Consume jobs until `shutdown` resolves or the queue closes. In-flight
    /// work finishes before the loop exits.
    pub async fn run_until<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        info!(provider = %self.provider, "worker listening for jobs");
        tokio::pin!(shutdown);
        loop {
            let next = tokio::select! {
                _ = &mut shutdown => None,
                payload = self.receiver.recv() => Some(payload),
            };
            match next {
                None => {
                    info!(provider = %self.provider, "worker shutting down");
                    break;
                }
                Some(Some(payload)) => self.handle_payload(payload).await,
                Some(None) => {
                    info!(provider = %self.provider, "queue closed; worker exiting");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_payload(&self, payload: JobPayload) {
        let run_id = payload.run_id;
        let job_key = payload.job_key();
        info!(run_id, provider = %self.provider, "processing agent job");

        let outcome = match self.engine.process(&payload).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                report_engine_failure(&self.db, &self.pipeline, &payload, &err).await;
                None
            }
        };

        // The job reached its end either way; release the idempotency key so
        // a later legitimate re-run is not mistaken for a duplicate.
        self.dispatcher.acknowledge(self.provider, &job_key).await;

        // A delegated job's run is finished by the sandboxed process, which
        // owns the completion check as well.
        if outcome == Some(EngineOutcome::Delegated) {
            return;
        }

        if let Some(parent_run_id) = payload.parent_run_id {
            let orchestrator = self.orchestrator.clone();
            spawn_reported("parent-completion-check", async move {
                let complete = orchestrator.check_parent_completion(parent_run_id).await?;
                if !complete {
                    warn!(parent_run_id, "parent not yet complete");
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::ChatMessage;
    use crate::db::{MarshalDb, NewRun};
    use crate::engine::{AgentRunner, ExecutionEngine, RunOutput};
    use crate::events::{AgentEvent, EventEmitter, EventPipeline, MessageRole};
    use crate::models::{AgentMode, RepoSpec};
    use crate::orchestrator::{CreateParentRun, SubTask};
    use crate::queue::InProcessQueue;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoRunner;

    #[async_trait]
    impl AgentRunner for EchoRunner {
        async fn execute(
            &self,
            payload: &JobPayload,
            _context: Vec<ChatMessage>,
            emitter: &EventEmitter,
        ) -> Result<RunOutput> {
            if payload.input_prompt.contains("explode") {
                anyhow::bail!("scripted failure");
            }
            emitter
                .emit(AgentEvent::Message {
                    role: MessageRole::Assistant,
                    text: format!("handled: {}", payload.input_prompt),
                })
                .await?;
            Ok(RunOutput {
                summary: Some("ok".to_string()),
                cost_cents: 1,
                tokens_used: 10,
            })
        }
    }

    struct Stack {
        db: DbHandle,
        pipeline: Arc<EventPipeline>,
        dispatcher: Arc<QueueDispatcher>,
        orchestrator: Arc<Orchestrator>,
        worker: Worker,
    }

    fn stack() -> Stack {
        let db = DbHandle::new(MarshalDb::new_in_memory().unwrap());
        let pipeline = Arc::new(EventPipeline::new(db.clone(), 64));
        let (queue, receiver) = InProcessQueue::new();
        let dispatcher = Arc::new(QueueDispatcher::new().register(AgentProvider::Claude, queue));
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), dispatcher.clone()));
        let engine = Arc::new(ExecutionEngine::new(
            db.clone(),
            pipeline.clone(),
            Arc::new(EchoRunner),
            100_000,
        ));
        let worker = Worker::new(
            AgentProvider::Claude,
            receiver,
            engine,
            dispatcher.clone(),
            orchestrator.clone(),
            db.clone(),
            pipeline.clone(),
        );
        Stack {
            db,
            pipeline,
            dispatcher,
            orchestrator,
            worker,
        }
    }

    fn parent_input(prompt: &str) -> CreateParentRun {
        CreateParentRun {
            tenant_id: 1,
            project_id: 7,
            ticket_id: None,
            provider: AgentProvider::Claude,
            mode: AgentMode::Implement,
            prompt: prompt.to_string(),
            resolved_prompt: format!("{} (resolved)", prompt),
            orchestration_mode: crate::models::OrchestrationMode::Sequential,
        }
    }

    fn sub_task(prompt: &str) -> SubTask {
        SubTask {
            prompt: prompt.to_string(),
            resolved_prompt: format!("{} (resolved)", prompt),
            repo: None,
        }
    }

    async fn wait_for_status(db: &DbHandle, run_id: i64, want: RunStatus) -> RunStatus {
        for _ in 0..200 {
            let run = db
                .call(move |db| db.get_run(run_id))
                .await
                .unwrap()
                .unwrap();
            if run.status == want {
                return run.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        db.call(move |db| db.get_run(run_id))
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_worker_drives_fan_out_to_parent_completion() {
        let stack = stack();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(stack.worker.run_until(async {
            let _ = shutdown_rx.await;
        }));

        let parent = stack
            .orchestrator
            .create_parent_run(parent_input("split work"))
            .await
            .unwrap();
        let children = stack
            .orchestrator
            .fan_out_sub_runs(
                1,
                parent.id,
                AgentProvider::Claude,
                AgentMode::Implement,
                7,
                vec![sub_task("part one"), sub_task("part two")],
            )
            .await
            .unwrap();

        for child in &children {
            assert_eq!(
                wait_for_status(&stack.db, child.id, RunStatus::Completed).await,
                RunStatus::Completed
            );
        }
        assert_eq!(
            wait_for_status(&stack.db, parent.id, RunStatus::Completed).await,
            RunStatus::Completed
        );

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_child_fails_parent_via_worker() {
        let stack = stack();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(stack.worker.run_until(async {
            let _ = shutdown_rx.await;
        }));

        let parent = stack
            .orchestrator
            .create_parent_run(parent_input("split work"))
            .await
            .unwrap();
        let children = stack
            .orchestrator
            .fan_out_sub_runs(
                1,
                parent.id,
                AgentProvider::Claude,
                AgentMode::Implement,
                7,
                vec![sub_task("fine"), sub_task("explode now")],
            )
            .await
            .unwrap();

        assert_eq!(
            wait_for_status(&stack.db, children[0].id, RunStatus::Completed).await,
            RunStatus::Completed
        );
        assert_eq!(
            wait_for_status(&stack.db, children[1].id, RunStatus::Failed).await,
            RunStatus::Failed
        );
        assert_eq!(
            wait_for_status(&stack.db, parent.id, RunStatus::Failed).await,
            RunStatus::Failed
        );

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown_signal() {
        let stack = stack();
        stack
            .worker
            .run_until(std::future::ready(()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_reported_swallows_failure() {
        let handle = spawn_reported("doomed", async { anyhow::bail!("nope") });
        // The task itself completes cleanly; the failure went to the log.
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_payload_lands_in_event_log() {
        let stack = stack();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(stack.worker.run_until(async {
            let _ = shutdown_rx.await;
        }));

        let new = NewRun {
            tenant_id: 1,
            project_id: 7,
            ticket_id: None,
            provider: AgentProvider::Claude,
            mode: AgentMode::Implement,
            input_prompt: "scoped".to_string(),
            resolved_prompt: None,
            parent_run_id: None,
            orchestration_mode: None,
        };
        let run = stack.db.call(move |db| db.create_run(&new)).await.unwrap();

        // A payload with both repo and repos is rejected before the engine
        // builds an emitter; the worker still owes the log an error event.
        let repo = RepoSpec {
            repository_id: 1,
            clone_url: "https://example.com/a.git".to_string(),
            default_branch: "main".to_string(),
            r#ref: None,
            allowed_paths: None,
        };
        let payload = JobPayload {
            run_id: run.id,
            tenant_id: 1,
            project_id: 7,
            ticket_id: None,
            provider: AgentProvider::Claude,
            mode: AgentMode::Implement,
            resolved_prompt: "scoped".to_string(),
            input_prompt: "scoped".to_string(),
            repo: Some(repo.clone()),
            repos: Some(vec![repo]),
            constraints: None,
            images: None,
            parent_run_id: None,
        };
        stack.dispatcher.dispatch(&payload).await.unwrap();

        assert_eq!(
            wait_for_status(&stack.db, run.id, RunStatus::Failed).await,
            RunStatus::Failed
        );
        let events = stack.pipeline.replay(run.id).await.unwrap();
        let error = events
            .iter()
            .find(|e| e.event_type == "error")
            .expect("rejected payload left no error event");
        assert!(
            error.payload["message"]
                .as_str()
                .unwrap()
                .contains("repo and repos")
        );

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sandboxed_payload_finalizes_parent() {
        // No worker consumes here: payloads are pulled off the queue and fed
        // through the sandbox entry point, the way a launched process
        // receives them.
        let db = DbHandle::new(MarshalDb::new_in_memory().unwrap());
        let pipeline = Arc::new(EventPipeline::new(db.clone(), 64));
        let (queue, mut receiver) = InProcessQueue::new();
        let dispatcher = Arc::new(QueueDispatcher::new().register(AgentProvider::Claude, queue));
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), dispatcher.clone()));
        let engine = ExecutionEngine::new(db.clone(), pipeline.clone(), Arc::new(EchoRunner), 100_000);

        let parent = orchestrator
            .create_parent_run(parent_input("hand off"))
            .await
            .unwrap();
        let children = orchestrator
            .fan_out_sub_runs(
                1,
                parent.id,
                AgentProvider::Claude,
                AgentMode::Implement,
                7,
                vec![sub_task("fine part"), sub_task("explode now")],
            )
            .await
            .unwrap();

        for _ in &children {
            let payload = receiver.recv().await.unwrap();
            run_sandboxed_payload(db.clone(), &pipeline, &engine, &payload)
                .await
                .unwrap();
        }

        let good = db
            .call({
                let id = children[0].id;
                move |db| db.get_run(id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(good.status, RunStatus::Completed);

        // The failing child still finalizes the parent from the sandbox side.
        let parent_row = db
            .call({
                let id = parent.id;
                move |db| db.get_run(id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parent_row.status, RunStatus::Failed);
    }
}
