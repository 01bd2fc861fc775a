//! Agent orchestration: lifecycle state machine, durable store, output
//! analysis, tool adapters, recovery and the controller that ties them
//! together.

pub mod adapter;
pub mod controller;
pub mod output;
pub mod output_log;
pub mod recovery;
pub mod state;
pub mod store;

pub use adapter::{AdapterRegistry, ClaudeCodeAdapter, CommandAdapter, SpawnRequest, ToolAdapter};
pub use controller::{AgentController, ControllerError, ControllerOptions, DEFAULT_MAX_CONCURRENT};
pub use output::{OutputAnalyzer, ParsedLine};
pub use output_log::OutputLog;
pub use recovery::{
    cleanup_expired, process_alive, restore_agents, RecoveryOptions, DEFAULT_GRACE_PERIOD_MS,
    DEFAULT_RETENTION_DAYS,
};
pub use state::{AgentStateMachine, InvalidTransition};
pub use store::{AgentStore, STATE_VERSION};
