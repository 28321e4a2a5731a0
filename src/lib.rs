//! Marshal — dispatch and supervision for long-running AI agent runs.
//!
//! ## Overview
//!
//! A run is one logical request for agent work. The orchestrator creates
//! run records and fans complex requests out into child runs, each enqueued
//! on its provider's queue under an idempotent job key. Workers consume
//! those queues and drive each payload to a terminal status through the
//! execution engine, emitting an ordered, durable event stream the whole
//! way. Parent runs complete automatically once every child reaches a
//! terminal state.
//!
//! ## Module Map
//!
//! ```text
//! client ──> orchestrator.rs  (create runs, fan out, aggregate completion)
//!                 │
//!                 │ dispatch(payload), key = run-<id>
//!                 v
//!            queue.rs  (JobQueue trait, per-provider InProcessQueue)
//!                 │
//!                 v
//!            worker.rs  (consume loop, terminal bookkeeping, ack)
//!                 │
//!                 v
//!            engine.rs  (single / multi-repo paths, sandbox delegation)
//!                 │                        │
//!                 │ AgentRunner            │ events
//!                 v                        v
//!            runner.rs  (process-backed    events.rs  (persist → broadcast)
//!                        agent sessions)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `models`     | Shared types: `Run`, `JobPayload`, status enums       |
//! | `db`         | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)   |
//! | `compaction` | Token-budget context compaction (pure functions)      |
//! | `sandbox`    | Sandbox config + base64 payload hand-off codec        |
//! | `errors`     | Typed error enums per subsystem                       |

pub mod compaction;
pub mod db;
pub mod engine;
pub mod errors;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod worker;
