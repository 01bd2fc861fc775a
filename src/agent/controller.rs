//! The orchestrator: admission control, lifecycle wiring, attach
//! arbitration and startup recovery.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::agent::adapter::{AdapterRegistry, SpawnRequest};
use crate::agent::output::OutputAnalyzer;
use crate::agent::output_log::OutputLog;
use crate::agent::recovery::{self, RecoveryOptions};
use crate::agent::state::AgentStateMachine;
use crate::agent::store::AgentStore;
use crate::detector::{PatternStatusDetector, DEFAULT_DEBOUNCE_MS};
use crate::domain::{
    AgentEvent, AgentRecord, AgentStatus, DetectedStatus, SpawnOptions,
};
use crate::pty::PtySession;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Orchestrator-level protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no agent with id '{0}'")]
    AgentNotFound(String),
    #[error("agent '{0}' is not waiting for input")]
    NotWaitingForInput(String),
    #[error("agent '{id}' is already attached by '{client}'")]
    AlreadyAttached { id: String, client: String },
    #[error("agent '{0}' has no live session")]
    NoSession(String),
}

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Concurrency cap: agents beyond this queue as `pending`
    pub max_concurrent: usize,
    /// Adapter used when a spawn names no tool
    pub default_tool: String,
    pub detector_debounce_ms: u64,
    pub pty_cols: u16,
    pub pty_rows: u16,
    pub buffer_capacity: usize,
    pub recovery: RecoveryOptions,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_tool: "claude".to_string(),
            detector_debounce_ms: DEFAULT_DEBOUNCE_MS,
            pty_cols: 120,
            pty_rows: 40,
            buffer_capacity: 10_000,
            recovery: RecoveryOptions::default(),
        }
    }
}

/// One agent's runtime machinery. The record is the persisted truth; the
/// rest exists only while this orchestrator process lives.
struct ManagedAgent {
    record: Mutex<AgentRecord>,
    state: AgentStateMachine,
    detector: PatternStatusDetector,
    analyzer: OutputAnalyzer,
    log: OutputLog,
    spawn_options: SpawnOptions,
    /// Absent before start and for agents recovered across a restart
    session: Mutex<Option<Arc<PtySession>>>,
    /// Exclusive-attach owner, if any
    attached_client: Mutex<Option<String>>,
}

impl ManagedAgent {
    fn record(&self) -> AgentRecord {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn session(&self) -> Option<Arc<PtySession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

type EventSubscriber = Box<dyn Fn(&AgentEvent) + Send>;

/// Admission state guarded by one mutex: the FIFO of queued agent ids plus
/// the number of slots reserved by spawns that are mid-start. A reserved
/// slot is not yet visible through the agent map's running count, so both
/// must be consulted together or two concurrent spawns can claim the last
/// slot.
#[derive(Default)]
struct Admission {
    queue: VecDeque<String>,
    reserved: usize,
}

/// Single-host orchestrator for interactive coding agents.
///
/// Construction runs recovery against the persisted state; from then on
/// every lifecycle transition is persisted before the corresponding event
/// reaches subscribers.
pub struct AgentController {
    store: AgentStore,
    logs_dir: PathBuf,
    adapters: AdapterRegistry,
    options: ControllerOptions,
    agents: Mutex<HashMap<String, Arc<ManagedAgent>>>,
    admission: Mutex<Admission>,
    subscribers: Mutex<Vec<(u64, EventSubscriber)>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
    next_subscriber_id: AtomicU64,
}

impl AgentController {
    /// Build the orchestrator and run startup recovery.
    ///
    /// `state_path` is the agents state file, `logs_dir` the directory of
    /// per-agent output logs.
    pub fn new(
        state_path: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
        adapters: AdapterRegistry,
        options: ControllerOptions,
    ) -> Result<Arc<Self>> {
        let controller = Arc::new(Self {
            store: AgentStore::new(state_path),
            logs_dir: logs_dir.into(),
            adapters,
            options,
            agents: Mutex::new(HashMap::new()),
            admission: Mutex::new(Admission::default()),
            subscribers: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
        });

        let restored = recovery::restore_agents(
            &controller.store,
            &controller.logs_dir,
            &controller.options.recovery,
        )?;
        if !restored.is_empty() {
            tracing::info!("Restored {} agent(s) from previous run", restored.len());
        }
        for record in restored {
            let agent = controller.create_managed(record, SpawnOptions::default());
            let id = agent.record().id;
            controller
                .agents
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, agent);
        }

        Ok(controller)
    }

    /// Admit a new agent: persist it as `pending`, then either start it
    /// immediately or queue it behind the concurrency cap.
    pub fn spawn(self: &Arc<Self>, options: SpawnOptions) -> Result<AgentRecord> {
        let id = format!("agent-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let record = AgentRecord::new(&id, options.prompt.clone(), options.name.clone());
        self.store.save(&record)?;

        let agent = self.create_managed(record.clone(), options);
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), agent);

        // Queue-or-reserve is one critical section; the reservation is
        // released only after the agent is countable (or terminal), so
        // concurrent spawns cannot both claim the last slot.
        let start_now = {
            let mut admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
            if self.running_count() + admission.reserved >= self.options.max_concurrent {
                admission.queue.push_back(id.clone());
                false
            } else {
                admission.reserved += 1;
                true
            }
        };

        if start_now {
            let started = self.start_agent(&id);
            self.release_reservation();
            // Re-drain: a failed start never occupied its slot, and a
            // fast-exiting start may have consumed its exit while the
            // reservation still blocked the queue
            self.process_queue();
            started?;
        } else {
            tracing::info!(
                "Agent {} queued (cap {} reached)",
                id,
                self.options.max_concurrent
            );
        }

        self.get_info(&id)
    }

    /// Start one admitted agent: spawn its PTY session and wire output,
    /// detector and exit handling. Any failure here lands the agent in
    /// `failed` with the error persisted.
    fn start_agent(self: &Arc<Self>, id: &str) -> Result<()> {
        let agent = self.get_agent(id)?;
        if let Err(err) = self.try_start(id, &agent) {
            let message = format!("{:#}", err);
            tracing::error!("Agent {} failed to start: {}", id, message);
            {
                let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
                record.error = Some(message);
            }
            if agent.state.fail().is_err() {
                // Already terminal; record the error anyway
                self.persist(&agent);
            }
            return Err(err);
        }
        Ok(())
    }

    fn try_start(self: &Arc<Self>, id: &str, agent: &Arc<ManagedAgent>) -> Result<()> {
        {
            let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
            record.started_at = Some(Utc::now());
        }
        agent.state.start()?;

        let tool = agent
            .spawn_options
            .tool
            .clone()
            .unwrap_or_else(|| self.options.default_tool.clone());
        let adapter = self.adapters.get(&tool)?;

        let request = SpawnRequest {
            agent_id: id.to_string(),
            prompt: agent.spawn_options.prompt.clone(),
            working_dir: agent.spawn_options.working_dir.clone(),
            env: agent.spawn_options.env.clone(),
            cols: self.options.pty_cols,
            rows: self.options.pty_rows,
            buffer_capacity: self.options.buffer_capacity,
        };
        let session = adapter
            .spawn(&request)
            .with_context(|| format!("Adapter '{}' failed to spawn agent {}", tool, id))?;

        {
            let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
            record.spawned_at = Some(Utc::now());
            record.pid = session.pid();
        }

        let weak = Arc::downgrade(self);
        let agent_id = id.to_string();
        session.on_data(move |chunk| {
            if let Some(controller) = weak.upgrade() {
                controller.handle_output(&agent_id, chunk);
            }
        });

        *agent.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        agent.state.run()?;

        // Wired after the running transition: a process that has already
        // exited fires this listener immediately, and the exit transitions
        // are only legal from running.
        let weak = Arc::downgrade(self);
        let agent_id = id.to_string();
        session.on_exit(move |status| {
            if let Some(controller) = weak.upgrade() {
                controller.handle_exit(&agent_id, status.exit_code, status.signal.clone());
            }
        });

        tracing::info!("Agent {} running (tool {})", id, tool);
        Ok(())
    }

    fn handle_output(&self, id: &str, chunk: &str) {
        let Ok(agent) = self.get_agent(id) else { return };

        for line in agent.analyzer.feed(chunk) {
            if let Err(err) = agent.log.append(&line.raw) {
                tracing::warn!("Output log append failed for {}: {}", id, err);
            }
        }
        agent.detector.feed(chunk);
        self.emit(AgentEvent::output(id, chunk));
    }

    fn handle_detected(&self, id: &str, detected: DetectedStatus) {
        let Ok(agent) = self.get_agent(id) else { return };

        match detected {
            DetectedStatus::WaitingInput => {
                if agent.state.current() == AgentStatus::Running
                    && agent.state.wait_for_input().is_ok()
                {
                    self.emit(AgentEvent::input_request(id));
                }
            }
            DetectedStatus::Running => {
                if agent.state.current() == AgentStatus::WaitingInput {
                    let _ = agent.state.run();
                }
            }
            _ => {}
        }
    }

    fn handle_exit(self: &Arc<Self>, id: &str, exit_code: i32, signal: Option<String>) {
        let Ok(agent) = self.get_agent(id) else { return };

        if let Some(line) = agent.analyzer.flush() {
            if let Err(err) = agent.log.append(&line.raw) {
                tracing::warn!("Output log append failed for {}: {}", id, err);
            }
        }

        {
            let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
            record.exit_code = Some(exit_code);
            let mut metrics = agent.analyzer.metrics();
            metrics.duration_ms = record
                .spawned_at
                .map(|spawned| (Utc::now() - spawned).num_milliseconds().max(0) as u64);
            record.metrics = metrics;
            if exit_code != 0 {
                record.error = Some(match &signal {
                    Some(signal) => format!("Process killed by signal {}", signal),
                    None => format!("Process exited with code {}", exit_code),
                });
            }
        }

        let result = if exit_code == 0 {
            agent.state.finish()
        } else {
            agent.state.fail()
        };
        if let Err(err) = result {
            tracing::warn!("Agent {} exit transition rejected: {}", id, err);
        }

        // The freed slot goes to the queue immediately, not on a timer
        self.process_queue();
    }

    /// Start queued agents while slots are free.
    fn process_queue(self: &Arc<Self>) {
        loop {
            let next = {
                let mut admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
                if self.running_count() + admission.reserved >= self.options.max_concurrent {
                    break;
                }
                // Ids killed while still queued are no longer pending
                let next = loop {
                    match admission.queue.pop_front() {
                        Some(id) => {
                            let pending = self
                                .get_agent(&id)
                                .map(|agent| agent.state.current() == AgentStatus::Pending)
                                .unwrap_or(false);
                            if pending {
                                break Some(id);
                            }
                            tracing::debug!("Skipping queued agent {} (no longer pending)", id);
                        }
                        None => break None,
                    }
                };
                match next {
                    Some(id) => {
                        admission.reserved += 1;
                        id
                    }
                    None => break,
                }
            };
            tracing::info!("Starting queued agent {}", next);
            if let Err(err) = self.start_agent(&next) {
                tracing::error!("Queued agent {} failed to start: {:#}", next, err);
            }
            self.release_reservation();
        }
    }

    fn release_reservation(&self) {
        let mut admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        admission.reserved = admission.reserved.saturating_sub(1);
    }

    fn running_count(&self) -> usize {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|agent| agent.state.is_running())
            .count()
    }

    /// Request termination. Cooperative when a live session exists: state
    /// finalizes when the exit event arrives, not here.
    pub fn kill(self: &Arc<Self>, id: &str, force: bool) -> Result<()> {
        let agent = self.get_agent(id)?;
        if agent.state.is_terminal() {
            tracing::info!("Agent {} already terminal, kill is a no-op", id);
            return Ok(());
        }

        // A queued agent must not be picked up by a later drain
        {
            let mut admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
            admission.queue.retain(|queued| queued != id);
        }

        let signal = if force { SIGKILL } else { SIGTERM };
        if let Some(session) = agent.session() {
            if session.is_running() {
                tracing::info!("Sending signal {} to agent {}", signal, id);
                return session.kill(signal);
            }
        }

        // No live session (recovered across a restart): signal the raw pid
        // if it is still around, then finalize directly since no exit event
        // will ever arrive.
        #[cfg(unix)]
        if let Some(pid) = agent.record().pid {
            if recovery::process_alive(pid) {
                unsafe { libc::kill(pid as i32, signal) };
            }
        }
        {
            let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
            record.error = Some("Killed by operator (no live session)".to_string());
        }
        agent.state.fail()?;
        self.process_queue();
        Ok(())
    }

    /// Deliver operator text to an agent that asked for input.
    pub fn send_input(&self, id: &str, text: &str) -> Result<()> {
        let agent = self.get_agent(id)?;
        if agent.state.current() != AgentStatus::WaitingInput {
            return Err(ControllerError::NotWaitingForInput(id.to_string()).into());
        }
        let session = agent
            .session()
            .ok_or_else(|| ControllerError::NoSession(id.to_string()))?;
        session.write(text)?;
        agent.state.run()?;
        Ok(())
    }

    /// Hide a terminal agent from listings; the record stays in storage.
    pub fn archive(&self, id: &str) -> Result<()> {
        let agent = self.get_agent(id)?;
        if !agent.state.is_terminal() {
            tracing::warn!("Agent {} is not terminal, refusing to archive", id);
            return Ok(());
        }
        {
            let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
            record.archived = true;
        }
        self.persist(&agent);
        Ok(())
    }

    /// Claim exclusive attach for `client`; returns the live session.
    pub fn attach(&self, id: &str, client: &str, force: bool) -> Result<Arc<PtySession>> {
        let agent = self.get_agent(id)?;
        let session = agent
            .session()
            .ok_or_else(|| ControllerError::NoSession(id.to_string()))?;

        let mut attached = agent
            .attached_client
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = attached.as_deref() {
            if existing != client {
                if !force {
                    return Err(ControllerError::AlreadyAttached {
                        id: id.to_string(),
                        client: existing.to_string(),
                    }
                    .into());
                }
                tracing::warn!("Client {} displaced {} on agent {}", client, existing, id);
            }
        }
        *attached = Some(client.to_string());
        Ok(session)
    }

    /// Release attach. With a client id, only the matching owner releases;
    /// with `None` the attach is cleared unconditionally.
    pub fn detach(&self, id: &str, client: Option<&str>) -> Result<()> {
        let agent = self.get_agent(id)?;
        let mut attached = agent
            .attached_client
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match (client, attached.as_deref()) {
            (None, _) => *attached = None,
            (Some(client), Some(existing)) if client == existing => *attached = None,
            (Some(client), existing) => {
                tracing::debug!(
                    "Detach by {} ignored, attach owner is {:?}",
                    client,
                    existing
                );
            }
        }
        Ok(())
    }

    pub fn is_attached(&self, id: &str) -> Result<bool> {
        let agent = self.get_agent(id)?;
        Ok(agent
            .attached_client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some())
    }

    pub fn get_status(&self, id: &str) -> Result<AgentStatus> {
        Ok(self.get_agent(id)?.state.current())
    }

    pub fn get_info(&self, id: &str) -> Result<AgentRecord> {
        Ok(self.get_agent(id)?.record())
    }

    /// All non-archived agents, oldest first.
    pub fn list_all(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|agent| agent.record())
            .filter(|record| !record.archived)
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// The last `n` persisted output lines.
    pub fn get_output(&self, id: &str, n: usize) -> Result<Vec<String>> {
        self.get_agent(id)?.log.tail(n)
    }

    /// The live session's buffered output; empty without a session.
    pub fn get_buffer(&self, id: &str) -> Result<String> {
        Ok(self
            .get_agent(id)?
            .session()
            .map(|session| session.buffered_output())
            .unwrap_or_default())
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self
            .get_agent(id)?
            .session()
            .ok_or_else(|| ControllerError::NoSession(id.to_string()))?;
        session.resize(cols, rows)
    }

    pub fn get_detected_status(&self, id: &str) -> Result<DetectedStatus> {
        Ok(self.get_agent(id)?.detector.current_status())
    }

    /// Manual operator correction of the detected status.
    pub fn override_status(
        &self,
        id: &str,
        status: DetectedStatus,
        pause_ms: Option<u64>,
    ) -> Result<()> {
        self.get_agent(id)?.detector.override_status(status, pause_ms);
        Ok(())
    }

    /// Record which workspace/branch an agent works in. The orchestrator
    /// treats both as opaque strings owned by the workspace provider.
    pub fn set_workspace_info(&self, id: &str, workspace_id: &str, branch: &str) -> Result<()> {
        let agent = self.get_agent(id)?;
        {
            let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
            record.workspace_id = workspace_id.to_string();
            record.branch = branch.to_string();
        }
        self.persist(&agent);
        Ok(())
    }

    /// Garbage-collect expired terminal records and their logs.
    pub fn cleanup(&self) -> Result<Vec<String>> {
        let removed = recovery::cleanup_expired(
            &self.store,
            &self.logs_dir,
            self.options.recovery.retention,
        )?;
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        for id in &removed {
            agents.remove(id);
        }
        Ok(removed)
    }

    /// Register a synchronous event subscriber.
    pub fn on_event(&self, subscriber: impl Fn(&AgentEvent) + Send + 'static) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(subscriber)));
        id
    }

    pub fn remove_subscriber(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sid, _)| *sid != id);
    }

    /// Channel-based event stream for async consumers. Closed receivers are
    /// pruned on the next emit.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    fn get_agent(&self, id: &str) -> Result<Arc<ManagedAgent>> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| ControllerError::AgentNotFound(id.to_string()).into())
    }

    /// Build the runtime machinery around one record and wire its state
    /// machine and detector back into the orchestrator.
    fn create_managed(
        self: &Arc<Self>,
        record: AgentRecord,
        spawn_options: SpawnOptions,
    ) -> Arc<ManagedAgent> {
        let id = record.id.clone();
        let agent = Arc::new(ManagedAgent {
            state: AgentStateMachine::new(record.status),
            detector: PatternStatusDetector::claude_code(self.options.detector_debounce_ms),
            analyzer: OutputAnalyzer::new(),
            log: OutputLog::new(&self.logs_dir, &id),
            record: Mutex::new(record),
            spawn_options,
            session: Mutex::new(None),
            attached_client: Mutex::new(None),
        });

        // Every transition persists before its event is emitted
        let weak = Arc::downgrade(self);
        let agent_ref = Arc::downgrade(&agent);
        let agent_id = id.clone();
        agent.state.on_transition(move |to, from| {
            let (Some(controller), Some(agent)) = (weak.upgrade(), agent_ref.upgrade()) else {
                return;
            };
            {
                let mut record = agent.record.lock().unwrap_or_else(|e| e.into_inner());
                record.status = to;
                if to.is_terminal() && record.finished_at.is_none() {
                    record.finished_at = Some(Utc::now());
                }
            }
            controller.persist(&agent);
            controller.emit(AgentEvent::status_change(&agent_id, from, to));
        });

        let weak = Arc::downgrade(self);
        let agent_id = id.clone();
        agent.detector.on_status_change(move |detected, _| {
            if let Some(controller) = weak.upgrade() {
                controller.handle_detected(&agent_id, detected);
            }
        });

        agent
    }

    fn persist(&self, agent: &ManagedAgent) {
        let record = agent.record();
        if let Err(err) = self.store.save(&record) {
            tracing::error!("Failed to persist agent {}: {:#}", record.id, err);
        }
    }

    fn emit(&self, event: AgentEvent) {
        {
            let guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for (id, subscriber) in guard.iter() {
                if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                    tracing::warn!("Event subscriber {} panicked", id);
                }
            }
        }
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
