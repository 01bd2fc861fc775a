//! Durable agent state, written atomically under the project directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::domain::AgentRecord;

/// Bumped when the on-disk shape changes incompatibly
pub const STATE_VERSION: u32 = 1;

/// The whole persisted collection: schema version plus id -> record
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    agents: HashMap<String, AgentRecord>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            agents: HashMap::new(),
        }
    }
}

/// Durable record of all agents, keyed by id.
///
/// Every save is read-modify-write of the full collection followed by a
/// temp-file write and atomic rename, so a crash mid-save never leaves a
/// half-written state file visible. A corrupt or missing file loads as an
/// empty collection; save failures propagate to the caller.
pub struct AgentStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl AgentStore {
    /// Open a store backed by `path` (e.g. `.conductor/state/agents.json`).
    /// Parent directories are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace one record.
    pub fn save(&self, record: &AgentRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.load_state();
        state.agents.insert(record.id.clone(), record.clone());
        self.write_state(&state)
    }

    /// Apply a mutation to one record and persist the result.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut AgentRecord)) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.load_state();
        let record = state
            .agents
            .get_mut(id)
            .with_context(|| format!("No persisted agent with id {}", id))?;
        mutate(record);
        self.write_state(&state)
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.load_state().agents.remove(id)
    }

    /// All persisted records, unordered.
    pub fn list(&self) -> Vec<AgentRecord> {
        self.load_state().agents.into_values().collect()
    }

    /// Remove one record. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.load_state();
        let existed = state.agents.remove(id).is_some();
        if existed {
            self.write_state(&state)?;
        }
        Ok(existed)
    }

    fn load_state(&self) -> StateFile {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return StateFile::default(),
        };
        match serde_json::from_str::<StateFile>(&content) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    "Unreadable state file {}, starting empty: {}",
                    self.path.display(),
                    err
                );
                StateFile::default()
            }
        }
    }

    fn write_state(&self, state: &StateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).context("Failed to move state file into place")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn store() -> (AgentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = AgentStore::new(dir.path().join("state").join("agents.json"));
        (store, dir)
    }

    #[test]
    fn save_and_get_round_trips_timestamps() {
        let (store, _dir) = store();
        let mut record = AgentRecord::new("agent-1", "fix the bug", None);
        record.spawned_at = Some(Utc::now());
        record.status = AgentStatus::Running;
        store.save(&record).unwrap();

        let loaded = store.get("agent-1").unwrap();
        assert_eq!(loaded.status, AgentStatus::Running);
        assert_eq!(loaded.created_at, record.created_at);
        assert_eq!(loaded.spawned_at, record.spawned_at);
        assert_eq!(loaded.finished_at, None);
    }

    #[test]
    fn update_mutates_in_place() {
        let (store, _dir) = store();
        store
            .save(&AgentRecord::new("agent-1", "task", None))
            .unwrap();

        store
            .update("agent-1", |r| {
                r.status = AgentStatus::Failed;
                r.error = Some("boom".to_string());
            })
            .unwrap();

        let loaded = store.get("agent-1").unwrap();
        assert_eq!(loaded.status, AgentStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));

        assert!(store.update("missing", |_| {}).is_err());
    }

    #[test]
    fn list_and_delete() {
        let (store, _dir) = store();
        store
            .save(&AgentRecord::new("agent-1", "one", None))
            .unwrap();
        store
            .save(&AgentRecord::new("agent-2", "two", None))
            .unwrap();
        assert_eq!(store.list().len(), 2);

        assert!(store.delete("agent-1").unwrap());
        assert!(!store.delete("agent-1").unwrap());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn missing_file_loads_empty() {
        let (store, _dir) = store();
        assert!(store.list().is_empty());
        assert!(store.get("anything").is_none());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.json");
        fs::write(&path, "{not json").unwrap();

        let store = AgentStore::new(&path);
        assert!(store.list().is_empty());

        // And saving over it works
        store
            .save(&AgentRecord::new("agent-1", "task", None))
            .unwrap();
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let (store, dir) = store();
        store
            .save(&AgentRecord::new("agent-1", "task", None))
            .unwrap();

        let state_dir = dir.path().join("state");
        let leftovers: Vec<_> = fs::read_dir(&state_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
