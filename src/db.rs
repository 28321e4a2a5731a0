use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params};

use crate::events::StoredEvent;
use crate::models::*;

/// Async-safe handle to the marshal database.
///
/// Wraps `MarshalDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MarshalDb>>,
}

impl DbHandle {
    pub fn new(db: MarshalDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MarshalDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; never call from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, MarshalDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Input for a run insert. Child runs set `parent_run_id`; only runs that
/// will have children set `orchestration_mode`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub tenant_id: i64,
    pub project_id: i64,
    pub ticket_id: Option<i64>,
    pub provider: AgentProvider,
    pub mode: AgentMode,
    pub input_prompt: String,
    pub resolved_prompt: Option<String>,
    pub parent_run_id: Option<i64>,
    pub orchestration_mode: Option<OrchestrationMode>,
}

pub struct MarshalDb {
    conn: Connection,
}

impl MarshalDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS agent_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id INTEGER NOT NULL,
                    project_id INTEGER NOT NULL,
                    ticket_id INTEGER,
                    provider TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    input_prompt TEXT NOT NULL,
                    resolved_prompt TEXT,
                    output_summary TEXT,
                    cost_cents INTEGER NOT NULL DEFAULT 0,
                    total_tokens_used INTEGER NOT NULL DEFAULT 0,
                    parent_run_id INTEGER REFERENCES agent_runs(id) ON DELETE SET NULL,
                    orchestration_mode TEXT,
                    compacted_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agent_run_repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id INTEGER NOT NULL,
                    run_id INTEGER NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
                    repository_id INTEGER NOT NULL,
                    branch TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    diff_summary TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(run_id, repository_id)
                );

                CREATE TABLE IF NOT EXISTS agent_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id INTEGER NOT NULL,
                    run_id INTEGER NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
                    ts TEXT NOT NULL,
                    type TEXT NOT NULL,
                    payload_json TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_tenant_project ON agent_runs(tenant_id, project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_runs_tenant_status ON agent_runs(tenant_id, status);
                CREATE INDEX IF NOT EXISTS idx_runs_parent ON agent_runs(parent_run_id);
                CREATE INDEX IF NOT EXISTS idx_run_repos_run ON agent_run_repos(run_id);
                CREATE INDEX IF NOT EXISTS idx_events_run_ts ON agent_events(run_id, ts, id);
                ",
            )
            .context("Failed to create tables")?;

        Ok(())
    }

    // ── Run CRUD ──────────────────────────────────────────────────────

    pub fn create_run(&self, new: &NewRun) -> Result<Run> {
        self.conn
            .execute(
                "INSERT INTO agent_runs
                 (tenant_id, project_id, ticket_id, provider, mode, status,
                  input_prompt, resolved_prompt, parent_run_id, orchestration_mode)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, ?8, ?9)",
                params![
                    new.tenant_id,
                    new.project_id,
                    new.ticket_id,
                    new.provider.as_str(),
                    new.mode.as_str(),
                    new.input_prompt,
                    new.resolved_prompt,
                    new.parent_run_id,
                    new.orchestration_mode.map(|m| m.as_str()),
                ],
            )
            .context("Failed to insert run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM agent_runs WHERE id = ?1",
                RUN_COLUMNS
            ))
            .context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![id], RunRow::from_row)
            .context("Failed to query run")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read run row")?.into_run()?)),
            None => Ok(None),
        }
    }

    pub fn list_child_runs(&self, parent_run_id: i64) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM agent_runs WHERE parent_run_id = ?1 ORDER BY id",
                RUN_COLUMNS
            ))
            .context("Failed to prepare list_child_runs")?;
        let rows = stmt
            .query_map(params![parent_run_id], RunRow::from_row)
            .context("Failed to query child runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub fn list_project_runs(&self, tenant_id: i64, project_id: i64) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM agent_runs
                 WHERE tenant_id = ?1 AND project_id = ?2 ORDER BY created_at DESC, id DESC",
                RUN_COLUMNS
            ))
            .context("Failed to prepare list_project_runs")?;
        let rows = stmt
            .query_map(params![tenant_id, project_id], RunRow::from_row)
            .context("Failed to query project runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Move a queued run to `running` and stamp `started_at`. Conditional on
    /// the current status, so a duplicate delivery cannot restart a run that
    /// already progressed. Returns whether the transition happened.
    pub fn mark_running(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE agent_runs SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![Utc::now().to_rfc3339(), id],
            )
            .context("Failed to mark run running")?;
        Ok(changed > 0)
    }

    /// Drive a run to a terminal status with a single conditional update:
    /// terminal rows are never rewritten. Returns whether a row changed.
    pub fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        output_summary: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("finish_run called with non-terminal status '{}'", status);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE agent_runs
                 SET status = ?1, output_summary = COALESCE(?2, output_summary), ended_at = ?3
                 WHERE id = ?4 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![status.as_str(), output_summary, Utc::now().to_rfc3339(), id],
            )
            .context("Failed to finish run")?;
        Ok(changed > 0)
    }

    /// Finalize a parent after all children reached a terminal state.
    /// Same conditional-update shape as `finish_run`; recomputing the same
    /// terminal status twice is harmless and an already-terminal parent is
    /// left untouched.
    pub fn finalize_parent(&self, parent_run_id: i64, status: RunStatus) -> Result<bool> {
        self.finish_run(parent_run_id, status, None)
    }

    pub fn record_usage(&self, id: i64, cost_cents: i64, tokens_used: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agent_runs
                 SET cost_cents = cost_cents + ?1, total_tokens_used = total_tokens_used + ?2
                 WHERE id = ?3",
                params![cost_cents, tokens_used, id],
            )
            .context("Failed to record usage")?;
        Ok(())
    }

    pub fn mark_compacted(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agent_runs SET compacted_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .context("Failed to mark run compacted")?;
        Ok(())
    }

    // ── Run-repository associations ───────────────────────────────────

    pub fn create_run_repos(
        &self,
        tenant_id: i64,
        run_id: i64,
        repos: &[(i64, String)],
    ) -> Result<Vec<RunRepo>> {
        for (repository_id, branch) in repos {
            self.conn
                .execute(
                    "INSERT INTO agent_run_repos (tenant_id, run_id, repository_id, branch, status)
                     VALUES (?1, ?2, ?3, ?4, 'pending')",
                    params![tenant_id, run_id, repository_id, branch],
                )
                .context("Failed to insert run repo")?;
        }
        self.list_run_repos(run_id)
    }

    pub fn update_repo_status(
        &self,
        run_id: i64,
        repository_id: i64,
        status: RepoStatus,
        diff_summary: Option<&str>,
    ) -> Result<Option<RunRepo>> {
        self.conn
            .execute(
                "UPDATE agent_run_repos
                 SET status = ?1, diff_summary = COALESCE(?2, diff_summary)
                 WHERE run_id = ?3 AND repository_id = ?4",
                params![status.as_str(), diff_summary, run_id, repository_id],
            )
            .context("Failed to update repo status")?;
        let mut repos = self.list_run_repos(run_id)?;
        Ok(repos
            .iter()
            .position(|r| r.repository_id == repository_id)
            .map(|i| repos.swap_remove(i)))
    }

    pub fn list_run_repos(&self, run_id: i64) -> Result<Vec<RunRepo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, tenant_id, run_id, repository_id, branch, status, diff_summary, created_at
                 FROM agent_run_repos WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_run_repos")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query run repos")?;
        let mut repos = Vec::new();
        for row in rows {
            let (id, tenant_id, run_id, repository_id, branch, status, diff_summary, created_at) =
                row.context("Failed to read run repo row")?;
            repos.push(RunRepo {
                id,
                tenant_id,
                run_id,
                repository_id,
                branch,
                status: RepoStatus::from_str(&status)
                    .map_err(|e| anyhow::anyhow!("Bad repo status in DB: {}", e))?,
                diff_summary,
                created_at,
            });
        }
        Ok(repos)
    }

    // ── Event log ─────────────────────────────────────────────────────

    /// Append one event to the durable, append-only log. Events are never
    /// mutated or deleted once written.
    pub fn append_event(
        &self,
        tenant_id: i64,
        run_id: i64,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO agent_events (tenant_id, run_id, ts, type, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    run_id,
                    Utc::now().to_rfc3339(),
                    event_type,
                    payload.to_string(),
                ],
            )
            .context("Failed to append event")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Full ordered event sequence for a run: timestamp order, ties broken
    /// by insert id, so replaying twice yields an identical sequence.
    pub fn list_events(&self, run_id: i64) -> Result<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, tenant_id, run_id, ts, type, payload_json
                 FROM agent_events WHERE run_id = ?1 ORDER BY ts, id",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, tenant_id, run_id, ts, event_type, payload_json) =
                row.context("Failed to read event row")?;
            events.push(StoredEvent {
                id,
                tenant_id,
                run_id,
                ts,
                event_type,
                payload: serde_json::from_str(&payload_json)
                    .context("Invalid event payload JSON in DB")?,
            });
        }
        Ok(events)
    }
}

const RUN_COLUMNS: &str = "id, tenant_id, project_id, ticket_id, provider, mode, status, \
     input_prompt, resolved_prompt, output_summary, cost_cents, total_tokens_used, \
     parent_run_id, orchestration_mode, compacted_at, created_at, started_at, ended_at";

/// Raw run row as stored; string enums are parsed in `into_run`.
struct RunRow {
    id: i64,
    tenant_id: i64,
    project_id: i64,
    ticket_id: Option<i64>,
    provider: String,
    mode: String,
    status: String,
    input_prompt: String,
    resolved_prompt: Option<String>,
    output_summary: Option<String>,
    cost_cents: i64,
    total_tokens_used: i64,
    parent_run_id: Option<i64>,
    orchestration_mode: Option<String>,
    compacted_at: Option<String>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            project_id: row.get(2)?,
            ticket_id: row.get(3)?,
            provider: row.get(4)?,
            mode: row.get(5)?,
            status: row.get(6)?,
            input_prompt: row.get(7)?,
            resolved_prompt: row.get(8)?,
            output_summary: row.get(9)?,
            cost_cents: row.get(10)?,
            total_tokens_used: row.get(11)?,
            parent_run_id: row.get(12)?,
            orchestration_mode: row.get(13)?,
            compacted_at: row.get(14)?,
            created_at: row.get(15)?,
            started_at: row.get(16)?,
            ended_at: row.get(17)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            ticket_id: self.ticket_id,
            provider: AgentProvider::from_str(&self.provider)
                .map_err(|e| anyhow::anyhow!("Bad provider in DB: {}", e))?,
            mode: AgentMode::from_str(&self.mode)
                .map_err(|e| anyhow::anyhow!("Bad mode in DB: {}", e))?,
            status: RunStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!("Bad status in DB: {}", e))?,
            input_prompt: self.input_prompt,
            resolved_prompt: self.resolved_prompt,
            output_summary: self.output_summary,
            cost_cents: self.cost_cents,
            total_tokens_used: self.total_tokens_used,
            parent_run_id: self.parent_run_id,
            orchestration_mode: self
                .orchestration_mode
                .as_deref()
                .map(OrchestrationMode::from_str)
                .transpose()
                .map_err(|e| anyhow::anyhow!("Bad orchestration mode in DB: {}", e))?,
            compacted_at: self.compacted_at,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> MarshalDb {
        MarshalDb::new_in_memory().unwrap()
    }

    fn new_run(tenant_id: i64, parent_run_id: Option<i64>) -> NewRun {
        NewRun {
            tenant_id,
            project_id: 7,
            ticket_id: None,
            provider: AgentProvider::Claude,
            mode: AgentMode::Implement,
            input_prompt: "fix the bug".to_string(),
            resolved_prompt: Some("fix the bug (resolved)".to_string()),
            parent_run_id,
            orchestration_mode: None,
        }
    }

    #[test]
    fn test_create_and_get_run() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.tenant_id, 1);
        assert!(run.started_at.is_none());
        assert!(run.ended_at.is_none());

        let fetched = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.input_prompt, "fix the bug");
    }

    #[test]
    fn test_get_run_missing_returns_none() {
        let db = test_db();
        assert!(db.get_run(999).unwrap().is_none());
    }

    #[test]
    fn test_mark_running_is_conditional() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();

        assert!(db.mark_running(run.id).unwrap());
        let running = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.started_at.is_some());

        // Second delivery of the same job must not restart the run.
        assert!(!db.mark_running(run.id).unwrap());
    }

    #[test]
    fn test_finish_run_refuses_terminal_rewrite() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();
        db.mark_running(run.id).unwrap();

        assert!(db.finish_run(run.id, RunStatus::Completed, Some("done")).unwrap());
        let done = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output_summary.as_deref(), Some("done"));
        assert!(done.ended_at.is_some());

        // A terminal run never regresses, even to another terminal status.
        assert!(!db.finish_run(run.id, RunStatus::Failed, None).unwrap());
        let still_done = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(still_done.status, RunStatus::Completed);
    }

    #[test]
    fn test_finish_run_rejects_non_terminal_status() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();
        assert!(db.finish_run(run.id, RunStatus::Running, None).is_err());
    }

    #[test]
    fn test_finalize_parent_is_idempotent() {
        let db = test_db();
        let parent = db.create_run(&new_run(1, None)).unwrap();
        assert!(db.finalize_parent(parent.id, RunStatus::Failed).unwrap());
        assert!(!db.finalize_parent(parent.id, RunStatus::Failed).unwrap());
        assert!(!db.finalize_parent(parent.id, RunStatus::Completed).unwrap());
        let row = db.get_run(parent.id).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Failed);
    }

    #[test]
    fn test_list_child_runs() {
        let db = test_db();
        let parent = db.create_run(&new_run(1, None)).unwrap();
        let a = db.create_run(&new_run(1, Some(parent.id))).unwrap();
        let b = db.create_run(&new_run(1, Some(parent.id))).unwrap();

        let children = db.list_child_runs(parent.id).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].id, a.id);
        assert_eq!(children[1].id, b.id);
        assert!(children.iter().all(|c| c.parent_run_id == Some(parent.id)));
    }

    #[test]
    fn test_record_usage_accumulates() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();
        db.record_usage(run.id, 12, 300).unwrap();
        db.record_usage(run.id, 5, 100).unwrap();
        let row = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(row.cost_cents, 17);
        assert_eq!(row.total_tokens_used, 400);
    }

    #[test]
    fn test_run_repo_lifecycle() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();
        let repos = db
            .create_run_repos(1, run.id, &[(10, "main".to_string()), (11, "develop".to_string())])
            .unwrap();
        assert_eq!(repos.len(), 2);
        assert!(repos.iter().all(|r| r.status == RepoStatus::Pending));

        let updated = db
            .update_repo_status(run.id, 10, RepoStatus::Succeeded, Some("2 files changed"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, RepoStatus::Succeeded);
        assert_eq!(updated.diff_summary.as_deref(), Some("2 files changed"));

        let listed = db.list_run_repos(run.id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].status, RepoStatus::Pending);
    }

    #[test]
    fn test_run_repo_unique_per_repository() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();
        db.create_run_repos(1, run.id, &[(10, "main".to_string())])
            .unwrap();
        assert!(
            db.create_run_repos(1, run.id, &[(10, "main".to_string())])
                .is_err()
        );
    }

    #[test]
    fn test_event_log_replay_is_stable() {
        let db = test_db();
        let run = db.create_run(&new_run(1, None)).unwrap();
        for i in 0..5 {
            db.append_event(
                1,
                run.id,
                "log",
                &serde_json::json!({ "text": format!("line {}", i) }),
            )
            .unwrap();
        }

        let first = db.list_events(run.id).unwrap();
        let second = db.list_events(run.id).unwrap();
        assert_eq!(first.len(), 5);
        let ids: Vec<i64> = first.iter().map(|e| e.id).collect();
        let ids_again: Vec<i64> = second.iter().map(|e| e.id).collect();
        assert_eq!(ids, ids_again);
        // Monotonic ids break timestamp ties, so order is strictly increasing.
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
