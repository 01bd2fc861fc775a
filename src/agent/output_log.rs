//! Append-only per-agent output logs.
//!
//! Raw output lines are appended as they arrive so they survive an
//! orchestrator crash; recovery re-reads the log to decide whether a dead
//! agent actually completed its run (see [`OutputLog::has_result_marker`]).

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::domain::StreamEvent;

/// Append-only log for one agent's raw output.
pub struct OutputLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl OutputLog {
    /// Log for `agent_id` under `logs_dir` (e.g. `.conductor/logs`).
    pub fn new(logs_dir: impl AsRef<Path>, agent_id: &str) -> Self {
        Self {
            path: logs_dir.as_ref().join(format!("{}.output.log", agent_id)),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one output line, creating the log file lazily.
    pub fn append(&self, line: &str) -> Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let file = match guard.as_mut() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .with_context(|| format!("Failed to open {}", self.path.display()))?;
                guard.insert(file)
            }
        };
        writeln!(file, "{}", line.trim_end_matches(['\r', '\n']))
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// All logged lines, oldest first. Missing log means no output.
    pub fn read_lines(&self) -> Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };
        let reader = BufReader::new(file);
        reader
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }

    /// The last `n` logged lines, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        let mut lines = self.read_lines()?;
        let skip = lines.len().saturating_sub(n);
        Ok(lines.split_off(skip))
    }

    /// Whether the log contains a terminal result record. Used at recovery
    /// to tell "finished, then the orchestrator died" apart from "the agent
    /// process died mid-run".
    pub fn has_result_marker(&self) -> bool {
        match self.read_lines() {
            Ok(lines) => lines
                .iter()
                .any(|line| StreamEvent::parse_line(line).is_result()),
            Err(err) => {
                tracing::warn!("Could not scan {}: {}", self.path.display(), err);
                false
            }
        }
    }

    /// Remove the log file, if present.
    pub fn remove(&self) -> Result<()> {
        // Drop the cached handle so a later append reopens a fresh file
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove {}", self.path.display()))
            }
        }
    }
}
