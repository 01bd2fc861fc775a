//! Per-agent lifecycle state machine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::AgentStatus;

/// Attempted transition outside the legal table
#[derive(Debug, thiserror::Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: AgentStatus,
    pub to: AgentStatus,
}

type TransitionListener = Box<dyn Fn(AgentStatus, AgentStatus) + Send>;

/// Validates and executes lifecycle transitions for one agent.
///
/// Transitions are atomic: the state is updated first, then every listener
/// is invoked synchronously with `(to, from)` in registration order. A
/// panicking listener is logged and skipped; it never blocks the others.
pub struct AgentStateMachine {
    current: Mutex<AgentStatus>,
    listeners: Arc<Mutex<Vec<(u64, TransitionListener)>>>,
    next_listener_id: AtomicU64,
}

/// Targets reachable from `from`, not counting the self-transition no-op.
fn legal_targets(from: AgentStatus) -> &'static [AgentStatus] {
    use AgentStatus::*;
    match from {
        Pending => &[Starting, Failed],
        Starting => &[Running, Failed],
        Running => &[WaitingInput, Finished, Failed],
        WaitingInput => &[Running, Finished, Failed],
        Finished | Failed => &[],
    }
}

impl AgentStateMachine {
    pub fn new(initial: AgentStatus) -> Self {
        Self {
            current: Mutex::new(initial),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> AgentStatus {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_terminal(&self) -> bool {
        self.current().is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.current().is_running()
    }

    /// Move to `to`. No-op when already there; fails when the transition is
    /// not in the legal table, leaving state unchanged.
    pub fn transition(&self, to: AgentStatus) -> Result<(), InvalidTransition> {
        let from = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            let from = *current;
            if from == to {
                return Ok(());
            }
            if !legal_targets(from).contains(&to) {
                return Err(InvalidTransition { from, to });
            }
            *current = to;
            from
        };

        // Listeners run outside the state lock so they may query current()
        let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for (id, listener) in guard.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(to, from))).is_err() {
                tracing::warn!("State transition listener {} panicked", id);
            }
        }
        Ok(())
    }

    pub fn start(&self) -> Result<(), InvalidTransition> {
        self.transition(AgentStatus::Starting)
    }

    pub fn run(&self) -> Result<(), InvalidTransition> {
        self.transition(AgentStatus::Running)
    }

    pub fn wait_for_input(&self) -> Result<(), InvalidTransition> {
        self.transition(AgentStatus::WaitingInput)
    }

    pub fn finish(&self) -> Result<(), InvalidTransition> {
        self.transition(AgentStatus::Finished)
    }

    pub fn fail(&self) -> Result<(), InvalidTransition> {
        self.transition(AgentStatus::Failed)
    }

    /// Register a transition listener; returns an id usable for removal.
    pub fn on_transition(
        &self,
        listener: impl Fn(AgentStatus, AgentStatus) + Send + 'static,
    ) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(lid, _)| *lid != id);
    }
}
