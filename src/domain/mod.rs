//! Core domain types for conductor

mod agent;
mod event;
mod status;
mod stream;

pub use agent::{AgentMetrics, AgentRecord, SpawnOptions};
pub use event::{AgentEvent, AgentEventKind};
pub use status::{AgentStatus, DetectedStatus};
pub use stream::StreamEvent;
