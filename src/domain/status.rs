use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created but not yet started (may be queued behind the concurrency cap)
    Pending,
    /// Start was requested, process not yet confirmed running
    Starting,
    /// Agent process is running
    Running,
    /// Agent is blocked on operator input
    WaitingInput,
    /// Agent exited successfully
    Finished,
    /// Agent exited with an error or was killed
    Failed,
}

impl AgentStatus {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Finished | AgentStatus::Failed)
    }

    /// States that occupy a concurrency slot.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            AgentStatus::Starting | AgentStatus::Running | AgentStatus::WaitingInput
        )
    }

    /// Get the status marker string used in state files and CLI output
    pub fn as_marker(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::WaitingInput => "waiting_input",
            AgentStatus::Finished => "finished",
            AgentStatus::Failed => "failed",
        }
    }

    /// Single-character icon for status tables
    pub fn icon(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "○",
            AgentStatus::Starting => "◔",
            AgentStatus::Running => "●",
            AgentStatus::WaitingInput => "◐",
            AgentStatus::Finished => "✓",
            AgentStatus::Failed => "✗",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_marker())
    }
}

/// Status classified from raw terminal output by the detector.
///
/// Distinct from [`AgentStatus`]: this is a heuristic reading of what the
/// agent appears to be doing, not its lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedStatus {
    /// No classification yet (or patterns did not match)
    Unknown,
    /// Output looks like a resting prompt
    Idle,
    /// Output shows activity (spinners, progress text)
    Running,
    /// Output shows a prompt waiting for operator input
    WaitingInput,
}

impl std::fmt::Display for DetectedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DetectedStatus::Unknown => "unknown",
            DetectedStatus::Idle => "idle",
            DetectedStatus::Running => "running",
            DetectedStatus::WaitingInput => "waiting_input",
        };
        write!(f, "{}", s)
    }
}
