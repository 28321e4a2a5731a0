use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Agent providers with a dedicated work queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentProvider {
    Codex,
    Claude,
}

impl AgentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
        }
    }

    pub const ALL: [AgentProvider; 2] = [Self::Codex, Self::Claude];
}

impl std::fmt::Display for AgentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "codex" => Ok(Self::Codex),
            "claude" => Ok(Self::Claude),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

/// What kind of work the agent is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Plan,
    Implement,
    Bugfix,
    Review,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Bugfix => "bugfix",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "implement" => Ok(Self::Implement),
            "bugfix" => Ok(Self::Bugfix),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid mode: {}", s)),
        }
    }
}

/// Lifecycle state of a run.
///
/// Transitions are monotonic: `queued → running → {completed | failed |
/// cancelled}`. Terminal states accept no further writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` respects the state machine.
    pub fn can_transition(&self, next: RunStatus) -> bool {
        match self {
            Self::Queued => matches!(
                next,
                Self::Running | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// How a parent run's children are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    Parallel,
    Sequential,
}

impl OrchestrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
        }
    }
}

impl std::fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            _ => Err(format!("Invalid orchestration mode: {}", s)),
        }
    }
}

/// Status of one repository's work within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid repo status: {}", s)),
        }
    }
}

/// One logical request for agent work; root of an optional parent/child tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub tenant_id: i64,
    pub project_id: i64,
    pub ticket_id: Option<i64>,
    pub provider: AgentProvider,
    pub mode: AgentMode,
    pub status: RunStatus,
    pub input_prompt: String,
    pub resolved_prompt: Option<String>,
    pub output_summary: Option<String>,
    pub cost_cents: i64,
    pub total_tokens_used: i64,
    pub parent_run_id: Option<i64>,
    pub orchestration_mode: Option<OrchestrationMode>,
    pub compacted_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

/// One repository's slice of a run. Unique per (run_id, repository_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRepo {
    pub id: i64,
    pub tenant_id: i64,
    pub run_id: i64,
    pub repository_id: i64,
    pub branch: String,
    pub status: RepoStatus,
    pub diff_summary: Option<String>,
    pub created_at: String,
}

/// Repository descriptor carried in a job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    pub repository_id: i64,
    pub clone_url: String,
    pub default_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<String>>,
}

impl RepoSpec {
    /// The branch the agent should work against: explicit ref if given,
    /// otherwise the default branch.
    pub fn work_branch(&self) -> &str {
        self.r#ref.as_deref().unwrap_or(&self.default_branch)
    }
}

/// Optional execution constraints attached to a payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_budget_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

/// Image or attachment reference included with a run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub url: String,
}

/// The unit of work handed through the queue to an executor.
///
/// At most one of `repo` / `repos` is populated; if both are absent the
/// run operates with no repository context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub run_id: i64,
    pub tenant_id: i64,
    pub project_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<i64>,
    pub provider: AgentProvider,
    pub mode: AgentMode,
    pub resolved_prompt: String,
    pub input_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<Vec<RepoSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<i64>,
}

impl JobPayload {
    /// The stable job key used for idempotent enqueue.
    pub fn job_key(&self) -> String {
        format!("run-{}", self.run_id)
    }

    /// Whether the payload should take the multi-repository path.
    pub fn is_multi_repo(&self) -> bool {
        self.repos.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// Copy of this payload scoped to a single repository: `repo` set,
    /// `repos` cleared so the copy can never recurse into the multi path.
    pub fn for_repo(&self, repo: &RepoSpec) -> JobPayload {
        let mut scoped = self.clone();
        scoped.repo = Some(repo.clone());
        scoped.repos = None;
        scoped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_roundtrip() {
        for s in &["codex", "claude"] {
            let parsed: AgentProvider = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<AgentProvider>().is_err());
    }

    #[test]
    fn test_mode_roundtrip() {
        for s in &["plan", "implement", "bugfix", "review"] {
            let parsed: AgentMode = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<AgentMode>().is_err());
    }

    #[test]
    fn test_run_status_roundtrip() {
        for s in &["queued", "running", "completed", "failed", "cancelled"] {
            let parsed: RunStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_run_status_transitions_are_monotonic() {
        assert!(RunStatus::Queued.can_transition(RunStatus::Running));
        assert!(RunStatus::Queued.can_transition(RunStatus::Cancelled));
        assert!(RunStatus::Running.can_transition(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition(RunStatus::Failed));

        // No regression out of terminal states, and running never goes back.
        assert!(!RunStatus::Running.can_transition(RunStatus::Queued));
        assert!(!RunStatus::Completed.can_transition(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition(RunStatus::Completed));
        assert!(!RunStatus::Cancelled.can_transition(RunStatus::Queued));
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&AgentProvider::Claude).unwrap(),
            "\"claude\""
        );
        assert_eq!(
            serde_json::to_string(&OrchestrationMode::Sequential).unwrap(),
            "\"sequential\""
        );
        assert_eq!(
            serde_json::to_string(&RepoStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
    }

    #[test]
    fn test_payload_wire_shape_is_camel_case() {
        let payload = JobPayload {
            run_id: 12,
            tenant_id: 3,
            project_id: 7,
            ticket_id: None,
            provider: AgentProvider::Claude,
            mode: AgentMode::Implement,
            resolved_prompt: "do it".to_string(),
            input_prompt: "do it".to_string(),
            repo: None,
            repos: None,
            constraints: Some(Constraints {
                time_budget_sec: Some(600),
                max_cost_cents: None,
                allowed_tools: None,
            }),
            images: None,
            parent_run_id: Some(11),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["runId"], 12);
        assert_eq!(json["parentRunId"], 11);
        assert_eq!(json["resolvedPrompt"], "do it");
        assert_eq!(json["constraints"]["timeBudgetSec"], 600);
        // Absent optionals are omitted from the wire shape entirely.
        assert!(json.get("repo").is_none());
        assert!(json.get("repos").is_none());
    }

    #[test]
    fn test_job_key_format() {
        let payload = JobPayload {
            run_id: 42,
            tenant_id: 1,
            project_id: 1,
            ticket_id: None,
            provider: AgentProvider::Codex,
            mode: AgentMode::Plan,
            resolved_prompt: String::new(),
            input_prompt: String::new(),
            repo: None,
            repos: None,
            constraints: None,
            images: None,
            parent_run_id: None,
        };
        assert_eq!(payload.job_key(), "run-42");
    }

    #[test]
    fn test_for_repo_clears_repo_list() {
        let repo_a = RepoSpec {
            repository_id: 1,
            clone_url: "https://example.com/a.git".to_string(),
            default_branch: "main".to_string(),
            r#ref: None,
            allowed_paths: None,
        };
        let repo_b = RepoSpec {
            repository_id: 2,
            clone_url: "https://example.com/b.git".to_string(),
            default_branch: "main".to_string(),
            r#ref: Some("develop".to_string()),
            allowed_paths: None,
        };
        let payload = JobPayload {
            run_id: 1,
            tenant_id: 1,
            project_id: 1,
            ticket_id: None,
            provider: AgentProvider::Claude,
            mode: AgentMode::Implement,
            resolved_prompt: String::new(),
            input_prompt: String::new(),
            repo: None,
            repos: Some(vec![repo_a.clone(), repo_b.clone()]),
            constraints: None,
            images: None,
            parent_run_id: None,
        };
        assert!(payload.is_multi_repo());

        let scoped = payload.for_repo(&repo_b);
        assert_eq!(scoped.repo, Some(repo_b.clone()));
        assert!(scoped.repos.is_none());
        assert!(!scoped.is_multi_repo());
        assert_eq!(repo_b.work_branch(), "develop");
        assert_eq!(repo_a.work_branch(), "main");
    }
}
