//! Event pipeline: publish → durable log → broadcast.
//!
//! Every run event is appended to the append-only `agent_events` log first
//! (the authoritative record), then rebroadcast to live subscribers over a
//! `tokio::sync::broadcast` channel. Subscribers that miss broadcasts lose
//! nothing: the durable log can be replayed in order at any time.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::DbHandle;

/// Who authored a `message` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// An immutable record of something that happened during a run.
///
/// Persisted verbatim as a tagged JSON object; the tag doubles as the
/// `type` column in the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Message {
        role: MessageRole,
        text: String,
    },
    Log {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Diff {
        unified_diff: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Artifact {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Preview {
        preview_url: String,
        branch: String,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    Compaction {
        tokens_before: u64,
        tokens_after: u64,
        summary: String,
    },
}

impl AgentEvent {
    /// The discriminant stored in the log's `type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Log { .. } => "log",
            Self::Diff { .. } => "diff",
            Self::Artifact { .. } => "artifact",
            Self::Error { .. } => "error",
            Self::Status { .. } => "status",
            Self::Preview { .. } => "preview",
            Self::Compaction { .. } => "compaction",
        }
    }

    /// Textual content used for token estimation during compaction.
    pub fn content_text(&self) -> &str {
        match self {
            Self::Message { text, .. } | Self::Log { text } => text,
            Self::Diff { unified_diff, .. } => unified_diff,
            Self::Error { message, .. } => message,
            Self::Status { message, .. } => message.as_deref().unwrap_or(""),
            Self::Artifact { name, .. } => name,
            Self::Preview { preview_url, .. } => preview_url,
            Self::Compaction { summary, .. } => summary,
        }
    }
}

/// One row of the durable event log, as replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub tenant_id: i64,
    pub run_id: i64,
    pub ts: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl StoredEvent {
    /// Decode the stored payload back into a typed event.
    pub fn event(&self) -> Result<AgentEvent> {
        serde_json::from_value(self.payload.clone()).context("Invalid stored event payload")
    }
}

/// Envelope broadcast to live subscribers. The run id travels alongside the
/// event so a single channel can serve observers of many runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub run_id: i64,
    pub event: AgentEvent,
}

/// The publish → persist → broadcast path for run progress.
#[derive(Clone)]
pub struct EventPipeline {
    db: DbHandle,
    tx: broadcast::Sender<String>,
}

impl EventPipeline {
    pub fn new(db: DbHandle, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { db, tx }
    }

    /// Subscribe to the live feed. Slow subscribers may lag and miss
    /// messages; the durable log remains the source of truth for catch-up.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Persist an event, then rebroadcast it. Persistence is authoritative:
    /// a broadcast with no listeners is not an error. Returns the log id.
    pub async fn emit(&self, tenant_id: i64, run_id: i64, event: AgentEvent) -> Result<i64> {
        let payload = serde_json::to_value(&event).context("Failed to serialize event")?;
        let event_type = event.type_name();

        let stored_payload = payload.clone();
        let id = self
            .db
            .call(move |db| db.append_event(tenant_id, run_id, event_type, &stored_payload))
            .await?;

        let envelope = serde_json::to_string(&EventEnvelope { run_id, event })
            .context("Failed to serialize event envelope")?;
        let _ = self.tx.send(envelope);

        Ok(id)
    }

    /// Replay the full ordered event sequence for a run.
    pub async fn replay(&self, run_id: i64) -> Result<Vec<StoredEvent>> {
        self.db.call(move |db| db.list_events(run_id)).await
    }
}

/// Per-run emitter handed to executors; carries the run scope so call sites
/// only name the event.
#[derive(Clone)]
pub struct EventEmitter {
    pipeline: Arc<EventPipeline>,
    run_id: i64,
    tenant_id: i64,
}

impl EventEmitter {
    pub fn new(pipeline: Arc<EventPipeline>, tenant_id: i64, run_id: i64) -> Self {
        Self {
            pipeline,
            run_id,
            tenant_id,
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub async fn emit(&self, event: AgentEvent) -> Result<i64> {
        self.pipeline.emit(self.tenant_id, self.run_id, event).await
    }
}
