use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::AgentStatus;

/// The kind of event emitted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    /// The agent moved between lifecycle states
    StatusChange {
        from: AgentStatus,
        to: AgentStatus,
    },
    /// A chunk of terminal output arrived
    Output { data: String },
    /// The agent appears to be waiting for operator input
    InputRequest,
}

/// An event emitted by the orchestrator for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Agent this event belongs to
    pub agent_id: String,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub kind: AgentEventKind,
}

impl AgentEvent {
    pub fn new(agent_id: impl Into<String>, kind: AgentEventKind) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Create a status-change event
    pub fn status_change(
        agent_id: impl Into<String>,
        from: AgentStatus,
        to: AgentStatus,
    ) -> Self {
        Self::new(agent_id, AgentEventKind::StatusChange { from, to })
    }

    /// Create an output event
    pub fn output(agent_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(agent_id, AgentEventKind::Output { data: data.into() })
    }

    /// Create an input-request event
    pub fn input_request(agent_id: impl Into<String>) -> Self {
        Self::new(agent_id, AgentEventKind::InputRequest)
    }
}
