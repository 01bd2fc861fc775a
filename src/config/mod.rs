//! Project configuration and on-disk layout.
//!
//! Everything lives under `.conductor/` in the project root: the TOML
//! config, the agents state file, and the per-agent output logs. Missing
//! config loads as defaults; unknown keys are ignored so older configs
//! keep working.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agent::{ControllerOptions, RecoveryOptions, DEFAULT_MAX_CONCURRENT};
use crate::agent::{DEFAULT_GRACE_PERIOD_MS, DEFAULT_RETENTION_DAYS};
use crate::attach::{DEFAULT_PREFIX_KEY, DEFAULT_PREFIX_TIMEOUT_MS};
use crate::detector::{DEFAULT_DEBOUNCE_MS, DEFAULT_OVERRIDE_PAUSE_MS};

/// Name of the project directory
pub const PROJECT_DIR: &str = ".conductor";

/// Filesystem layout rooted at one project directory
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    /// Layout under `<project_root>/.conductor/`.
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            root: project_root.as_ref().join(PROJECT_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state").join("agents.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create the directory skeleton.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.root.clone(), self.root.join("state"), self.logs_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Concurrency cap for running agents
    pub max_concurrent: usize,
    /// Adapter used when spawn names no tool
    pub default_tool: String,
    /// Days to keep terminal agents before cleanup
    pub retention_days: u64,
    /// Liveness-probe grace period after spawn, in milliseconds
    pub grace_period_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_tool: "claude".to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSection {
    pub debounce_ms: u64,
    pub override_pause_ms: u64,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            override_pause_ms: DEFAULT_OVERRIDE_PAUSE_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachSection {
    /// Prefix key in tmux notation, e.g. "C-]"
    pub prefix_key: String,
    pub prefix_timeout_ms: u64,
}

impl Default for AttachSection {
    fn default() -> Self {
        Self {
            prefix_key: DEFAULT_PREFIX_KEY.to_string(),
            prefix_timeout_ms: DEFAULT_PREFIX_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtySection {
    pub cols: u16,
    pub rows: u16,
    pub buffer_capacity: usize,
}

impl Default for PtySection {
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 40,
            buffer_capacity: 10_000,
        }
    }
}

/// The project config file (`.conductor/config.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSection,
    pub detector: DetectorSection,
    pub attach: AttachSection,
    pub pty: PtySection,
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is missing.
    /// A present-but-unparseable file is an error, not a silent default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Write the config, atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename config file: {}", path.display()))?;
        Ok(())
    }

    /// Translate config values into orchestrator options.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            max_concurrent: self.agent.max_concurrent,
            default_tool: self.agent.default_tool.clone(),
            detector_debounce_ms: self.detector.debounce_ms,
            pty_cols: self.pty.cols,
            pty_rows: self.pty.rows,
            buffer_capacity: self.pty.buffer_capacity,
            recovery: RecoveryOptions {
                grace_period: std::time::Duration::from_millis(self.agent.grace_period_ms),
                retention: std::time::Duration::from_secs(
                    self.agent.retention_days * 24 * 60 * 60,
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.agent.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(config.attach.prefix_key, "C-]");
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.agent.max_concurrent = 5;
        config.detector.debounce_ms = 250;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.agent.max_concurrent, 5);
        assert_eq!(loaded.detector.debounce_ms, 250);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nmax_concurrent = 1\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.agent.max_concurrent, 1);
        assert_eq!(loaded.agent.default_tool, "claude");
        assert_eq!(loaded.pty.cols, 120);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_concurrent = [broken").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn project_paths_layout() {
        let paths = ProjectPaths::new("/tmp/project");
        assert_eq!(
            paths.state_file(),
            PathBuf::from("/tmp/project/.conductor/state/agents.json")
        );
        assert_eq!(
            paths.logs_dir(),
            PathBuf::from("/tmp/project/.conductor/logs")
        );
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/tmp/project/.conductor/config.toml")
        );
    }
}
