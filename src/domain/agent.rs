use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::status::AgentStatus;

/// Usage metrics accumulated while an agent runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Number of tool calls observed in the output stream
    pub tool_calls: u64,

    /// Files the agent touched (extracted from tool-call inputs)
    pub files_modified: Vec<String>,

    /// Wall-clock duration in milliseconds, set when the agent finishes
    pub duration_ms: Option<u64>,
}

/// Persisted record of a single agent.
///
/// Everything needed to display and recover an agent across orchestrator
/// restarts lives here; live handles (PTY session, detector) do not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique agent identifier (e.g. "agent-3fa81c92")
    pub id: String,

    /// Optional friendly name
    pub name: Option<String>,

    /// The task prompt the agent was spawned with
    pub prompt: String,

    /// Owning workspace identifier (opaque to the orchestrator)
    #[serde(default)]
    pub workspace_id: String,

    /// Branch the agent works on (opaque to the orchestrator)
    #[serde(default)]
    pub branch: String,

    /// Current lifecycle status
    pub status: AgentStatus,

    /// OS process id, set once the process has actually been spawned
    pub pid: Option<u32>,

    /// When the record was created (admission time)
    pub created_at: DateTime<Utc>,

    /// When the OS process was actually launched. Never changes once set;
    /// recovery uses it for the liveness grace period.
    pub spawned_at: Option<DateTime<Utc>>,

    /// When the agent entered `starting`
    pub started_at: Option<DateTime<Utc>>,

    /// When the agent reached a terminal state. Set iff status is terminal.
    pub finished_at: Option<DateTime<Utc>>,

    /// Process exit code, if it exited
    pub exit_code: Option<i32>,

    /// Last error message, if any
    pub error: Option<String>,

    /// Usage metrics
    #[serde(default)]
    pub metrics: AgentMetrics,

    /// Archived records are kept in storage but hidden from listings
    #[serde(default)]
    pub archived: bool,
}

impl AgentRecord {
    /// Create a fresh record in `pending` state
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            prompt: prompt.into(),
            workspace_id: String::new(),
            branch: String::new(),
            status: AgentStatus::Pending,
            pid: None,
            created_at: Utc::now(),
            spawned_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            metrics: AgentMetrics::default(),
            archived: false,
        }
    }
}

/// Options for spawning a new agent
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// The task prompt
    pub prompt: String,

    /// Optional friendly name
    pub name: Option<String>,

    /// Working directory for the agent process (supplied by the workspace
    /// provider; defaults to the project root)
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the agent process
    pub env: HashMap<String, String>,

    /// Tool adapter to use (defaults to the configured default tool)
    pub tool: Option<String>,
}

impl SpawnOptions {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}
