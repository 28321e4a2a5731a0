//! Queue dispatch: one work queue per provider, idempotent enqueue by
//! job key.
//!
//! The broker is behind the `JobQueue` trait so the in-process
//! implementation used here (and in tests) can be swapped for a real
//! broker without touching the orchestrator. Enqueue keyed by
//! `run-<runId>` is a no-op duplicate suppression, which is what makes
//! fan-out safe to retry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::errors::DispatchError;
use crate::models::{AgentProvider, JobPayload};

/// What an enqueue attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The key was already in flight; nothing was added.
    Duplicate,
}

/// A provider work queue. Enqueue must suppress duplicates by job key;
/// `acknowledge` releases the key once the job reaches a terminal outcome
/// so a later legitimate re-run is not mistaken for a duplicate.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        job_key: &str,
        payload: JobPayload,
    ) -> Result<EnqueueOutcome, DispatchError>;

    async fn acknowledge(&self, job_key: &str);
}

/// Consumer side of an in-process queue.
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<JobPayload>,
}

impl JobReceiver {
    /// Receive the next payload; `None` once all senders are gone.
    pub async fn recv(&mut self) -> Option<JobPayload> {
        self.rx.recv().await
    }
}

/// In-process broker built on an unbounded mpsc channel plus an in-flight
/// key set for duplicate suppression.
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<JobPayload>,
    in_flight: Mutex<HashSet<String>>,
}

impl InProcessQueue {
    pub fn new() -> (Arc<Self>, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                in_flight: Mutex::new(HashSet::new()),
            }),
            JobReceiver { rx },
        )
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(
        &self,
        job_key: &str,
        payload: JobPayload,
    ) -> Result<EnqueueOutcome, DispatchError> {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains(job_key) {
            debug!(job_key, "duplicate enqueue suppressed");
            return Ok(EnqueueOutcome::Duplicate);
        }
        self.tx
            .send(payload)
            .map_err(|_| DispatchError::BrokerUnavailable("queue receiver closed".to_string()))?;
        in_flight.insert(job_key.to_string());
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn acknowledge(&self, job_key: &str) {
        self.in_flight.lock().await.remove(job_key);
    }
}

/// Routes a payload to its provider's queue under the stable job key.
pub struct QueueDispatcher {
    queues: HashMap<AgentProvider, Arc<dyn JobQueue>>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    pub fn register(mut self, provider: AgentProvider, queue: Arc<dyn JobQueue>) -> Self {
        self.queues.insert(provider, queue);
        self
    }

    /// The queue for a provider. A missing route is a configuration error:
    /// fail fast, no retry.
    pub fn queue_for(&self, provider: AgentProvider) -> Result<&Arc<dyn JobQueue>, DispatchError> {
        self.queues
            .get(&provider)
            .ok_or_else(|| DispatchError::NoQueueForProvider {
                provider: provider.to_string(),
            })
    }

    /// Enqueue a payload under its `run-<runId>` key.
    pub async fn dispatch(&self, payload: &JobPayload) -> Result<EnqueueOutcome, DispatchError> {
        let queue = self.queue_for(payload.provider)?;
        let job_key = payload.job_key();
        let outcome = queue.enqueue(&job_key, payload.clone()).await?;
        info!(
            run_id = payload.run_id,
            provider = %payload.provider,
            job_key,
            ?outcome,
            "job dispatched"
        );
        Ok(outcome)
    }

    /// Release a finished job's key on the owning provider queue.
    pub async fn acknowledge(&self, provider: AgentProvider, job_key: &str) {
        if let Ok(queue) = self.queue_for(provider) {
            queue.acknowledge(job_key).await;
        }
    }
}

impl Default for QueueDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
