//! Tool adapters: how the orchestrator launches a concrete agent CLI.
//!
//! The orchestrator is adapter-agnostic; it only needs something that can
//! turn a spawn request into a live [`PtySession`]. Adapters are registered
//! explicitly at construction, never through process-wide globals.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use crate::pty::{PtySession, PtySessionOptions};

/// Everything an adapter needs to launch one agent
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent_id: String,
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub buffer_capacity: usize,
}

/// Launches an agent CLI inside a PTY.
pub trait ToolAdapter: Send + Sync {
    /// Registry key, e.g. "claude".
    fn name(&self) -> &str;

    /// Spawn the agent process. The returned session is already running.
    fn spawn(&self, request: &SpawnRequest) -> Result<Arc<PtySession>>;

    /// Whether the underlying CLI is usable on this host.
    fn health_check(&self) -> bool;
}

impl std::fmt::Debug for dyn ToolAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAdapter")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Explicitly constructed set of adapters, injected into the orchestrator.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register the built-in adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeCodeAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ToolAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .with_context(|| format!("No tool adapter registered for '{}'", name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Adapter for the Claude Code CLI in interactive mode.
///
/// The prompt is written into the session after spawn rather than passed
/// as an argument, keeping it out of the process table and matching how an
/// operator would type it.
pub struct ClaudeCodeAdapter {
    binary: String,
    extra_args: Vec<String>,
}

impl ClaudeCodeAdapter {
    pub fn new() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<Arc<PtySession>> {
        let mut env = request.env.clone();
        env.insert("CONDUCTOR_AGENT_ID".to_string(), request.agent_id.clone());

        let session = Arc::new(PtySession::new(PtySessionOptions {
            command: self.binary.clone(),
            args: self.extra_args.clone(),
            cwd: request.working_dir.clone(),
            env,
            cols: request.cols,
            rows: request.rows,
            buffer_capacity: request.buffer_capacity,
        }));
        session.spawn()?;

        if !request.prompt.is_empty() {
            session
                .write(&format!("{}\r", request.prompt))
                .context("Failed to send prompt to agent")?;
        }
        Ok(session)
    }

    fn health_check(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Adapter that runs an arbitrary command, used for scripted agents and in
/// tests where the real CLI is unavailable.
pub struct CommandAdapter {
    name: String,
    command: String,
    args: Vec<String>,
    /// When false, the prompt is not written into the session after spawn
    send_prompt: bool,
}

impl CommandAdapter {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            send_prompt: true,
        }
    }

    pub fn without_prompt(mut self) -> Self {
        self.send_prompt = false;
        self
    }
}

impl ToolAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<Arc<PtySession>> {
        let session = Arc::new(PtySession::new(PtySessionOptions {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: request.working_dir.clone(),
            env: request.env.clone(),
            cols: request.cols,
            rows: request.rows,
            buffer_capacity: request.buffer_capacity,
        }));
        session.spawn()?;

        if self.send_prompt && !request.prompt.is_empty() {
            session
                .write(&format!("{}\r", request.prompt))
                .context("Failed to send prompt to agent")?;
        }
        Ok(session)
    }

    fn health_check(&self) -> bool {
        Command::new(&self.command)
            .arg("--version")
            .output()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SpawnRequest {
        SpawnRequest {
            agent_id: "agent-test".to_string(),
            prompt: String::new(),
            working_dir: None,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
            buffer_capacity: 100,
        }
    }

    #[test]
    fn registry_lookup() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(CommandAdapter::new(
            "sh",
            "/bin/sh",
            vec!["-c".to_string(), "true".to_string()],
        )));

        assert!(registry.get("sh").is_ok());
        let err = registry.get("nope").unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(registry.names(), vec!["sh"]);
    }

    #[test]
    fn command_adapter_spawns_and_sends_prompt() {
        let adapter = CommandAdapter::new(
            "sh",
            "/bin/sh",
            vec!["-c".to_string(), "read line; echo got:$line".to_string()],
        );

        let mut req = request();
        req.prompt = "hello".to_string();
        let session = adapter.spawn(&req).unwrap();

        let start = std::time::Instant::now();
        while session.is_running() && start.elapsed() < std::time::Duration::from_secs(10) {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(session.buffered_output().contains("got:hello"));
    }
}
