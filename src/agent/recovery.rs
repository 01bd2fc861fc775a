//! Startup reconciliation of persisted agents against live OS processes.
//!
//! Runs once when the orchestrator is constructed. PTY file descriptors
//! cannot be reacquired across a restart, so recovery never reattaches; it
//! only decides which records to carry back into memory and what their
//! status should be.

use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::time::Duration;

use crate::agent::output_log::OutputLog;
use crate::agent::store::AgentStore;
use crate::domain::{AgentRecord, AgentStatus};

pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Window after `spawned_at` during which liveness checks are skipped:
    /// a process launched moments before the crash may not be probeable yet
    pub grace_period: Duration,
    /// Terminal records older than this are not restored
    pub retention: Duration,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * 24 * 60 * 60),
        }
    }
}

/// Whether `pid` refers to a live process.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Reconcile all persisted records; returns the ones to restore in memory.
///
/// Status corrections (dead process resolved to finished/failed) are
/// persisted before returning.
pub fn restore_agents(
    store: &AgentStore,
    logs_dir: &Path,
    options: &RecoveryOptions,
) -> anyhow::Result<Vec<AgentRecord>> {
    restore_agents_with_probe(store, logs_dir, options, process_alive)
}

pub fn restore_agents_with_probe(
    store: &AgentStore,
    logs_dir: &Path,
    options: &RecoveryOptions,
    alive: impl Fn(u32) -> bool,
) -> anyhow::Result<Vec<AgentRecord>> {
    let now = Utc::now();
    let grace = ChronoDuration::from_std(options.grace_period).unwrap_or(ChronoDuration::zero());
    let retention =
        ChronoDuration::from_std(options.retention).unwrap_or(ChronoDuration::days(7));

    let mut restored = Vec::new();
    for mut record in store.list() {
        if record.archived {
            continue;
        }

        if record.status.is_terminal() {
            let expired = record
                .finished_at
                .map(|finished| now - finished > retention)
                .unwrap_or(false);
            if expired {
                tracing::debug!("Agent {} expired, not restoring", record.id);
                continue;
            }
            // Kept for status display only; no process to check
            restored.push(record);
            continue;
        }

        let within_grace = record
            .spawned_at
            .map(|spawned| now - spawned <= grace)
            .unwrap_or(false);
        if within_grace {
            tracing::info!("Agent {} within spawn grace period, restoring as-is", record.id);
            restored.push(record);
            continue;
        }

        // A record with no pid never had a process (queued or mid-start at
        // shutdown); there is nothing to probe or condemn
        let Some(pid) = record.pid else {
            tracing::info!("Agent {} was never spawned, restoring as-is", record.id);
            restored.push(record);
            continue;
        };

        if alive(pid) {
            // Alive but unreachable through a PTY: restore sessionless
            tracing::info!(
                "Agent {} (pid {:?}) still running, restoring without session",
                record.id,
                record.pid
            );
            restored.push(record);
            continue;
        }

        // Process gone: the output log decides finished vs failed
        let log = OutputLog::new(logs_dir, &record.id);
        let (status, error) = if log.has_result_marker() {
            (AgentStatus::Finished, None)
        } else {
            (
                AgentStatus::Failed,
                Some("Process terminated unexpectedly (no result found)".to_string()),
            )
        };
        tracing::info!("Agent {} process is gone, recovering as {}", record.id, status);

        record.status = status;
        record.error = error;
        record.finished_at = Some(now);
        store.save(&record)?;
        restored.push(record);
    }

    Ok(restored)
}

/// Garbage-collect terminal records past the retention window, together
/// with their output logs. Returns the ids removed.
pub fn cleanup_expired(
    store: &AgentStore,
    logs_dir: &Path,
    retention: Duration,
) -> anyhow::Result<Vec<String>> {
    let now = Utc::now();
    let retention = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::days(7));

    let mut removed = Vec::new();
    for record in store.list() {
        if !record.status.is_terminal() {
            continue;
        }
        let expired = record
            .finished_at
            .map(|finished| now - finished > retention)
            .unwrap_or(false);
        if !expired {
            continue;
        }

        store.delete(&record.id)?;
        if let Err(err) = OutputLog::new(logs_dir, &record.id).remove() {
            tracing::warn!("Could not remove log for {}: {}", record.id, err);
        }
        removed.push(record.id);
    }

    if !removed.is_empty() {
        tracing::info!("Cleaned up {} expired agent(s)", removed.len());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (AgentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = AgentStore::new(dir.path().join("agents.json"));
        (store, dir)
    }

    fn record(id: &str, status: AgentStatus) -> AgentRecord {
        let mut r = AgentRecord::new(id, "task", None);
        r.status = status;
        r
    }

    #[test]
    fn archived_records_are_skipped() {
        let (store, dir) = setup();
        let mut r = record("a", AgentStatus::Finished);
        r.archived = true;
        r.finished_at = Some(Utc::now());
        store.save(&r).unwrap();

        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| false)
                .unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn recent_terminal_records_restore_as_is() {
        let (store, dir) = setup();
        let mut r = record("a", AgentStatus::Finished);
        r.finished_at = Some(Utc::now() - ChronoDuration::days(1));
        store.save(&r).unwrap();

        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| false)
                .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].status, AgentStatus::Finished);
    }

    #[test]
    fn expired_terminal_records_are_not_restored() {
        let (store, dir) = setup();
        let mut r = record("a", AgentStatus::Failed);
        r.finished_at = Some(Utc::now() - ChronoDuration::days(8));
        store.save(&r).unwrap();

        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| false)
                .unwrap();
        assert!(restored.is_empty());
        // Expired records stay on disk until an explicit cleanup pass
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn grace_period_skips_liveness_probe() {
        let (store, dir) = setup();
        let mut r = record("a", AgentStatus::Starting);
        r.spawned_at = Some(Utc::now());
        r.pid = Some(999_999);
        store.save(&r).unwrap();

        // Probe says dead, but the spawn is fresh
        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| false)
                .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].status, AgentStatus::Starting);
    }

    #[test]
    fn never_spawned_records_are_not_condemned() {
        let (store, dir) = setup();
        // Queued at shutdown: pending, no pid, no spawned_at
        store.save(&record("a", AgentStatus::Pending)).unwrap();

        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| false)
                .unwrap();
        assert_eq!(restored[0].status, AgentStatus::Pending);
        assert!(restored[0].error.is_none());
        assert_eq!(store.get("a").unwrap().status, AgentStatus::Pending);
    }

    #[test]
    fn dead_pid_with_result_marker_recovers_finished() {
        let (store, dir) = setup();
        let mut r = record("a", AgentStatus::Running);
        r.spawned_at = Some(Utc::now() - ChronoDuration::minutes(5));
        r.pid = Some(999_999);
        store.save(&r).unwrap();

        OutputLog::new(dir.path(), "a")
            .append(r#"{"type":"result","message":{"content":"done"}}"#)
            .unwrap();

        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| false)
                .unwrap();
        assert_eq!(restored[0].status, AgentStatus::Finished);
        assert!(restored[0].error.is_none());
        // The correction is persisted
        assert_eq!(store.get("a").unwrap().status, AgentStatus::Finished);
    }

    #[test]
    fn dead_pid_without_marker_recovers_failed() {
        let (store, dir) = setup();
        let mut r = record("a", AgentStatus::Running);
        r.spawned_at = Some(Utc::now() - ChronoDuration::minutes(5));
        r.pid = Some(999_999);
        store.save(&r).unwrap();

        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| false)
                .unwrap();
        assert_eq!(restored[0].status, AgentStatus::Failed);
        assert!(restored[0]
            .error
            .as_deref()
            .unwrap()
            .contains("terminated unexpectedly"));
        assert!(restored[0].finished_at.is_some());
    }

    #[test]
    fn live_pid_restores_without_status_change() {
        let (store, dir) = setup();
        let mut r = record("a", AgentStatus::Running);
        r.spawned_at = Some(Utc::now() - ChronoDuration::minutes(5));
        r.pid = Some(42);
        store.save(&r).unwrap();

        let restored =
            restore_agents_with_probe(&store, dir.path(), &RecoveryOptions::default(), |_| true)
                .unwrap();
        assert_eq!(restored[0].status, AgentStatus::Running);
    }

    #[test]
    fn cleanup_removes_expired_records_and_logs() {
        let (store, dir) = setup();
        let mut old = record("old", AgentStatus::Finished);
        old.finished_at = Some(Utc::now() - ChronoDuration::days(30));
        store.save(&old).unwrap();
        let mut fresh = record("fresh", AgentStatus::Finished);
        fresh.finished_at = Some(Utc::now());
        store.save(&fresh).unwrap();

        let log = OutputLog::new(dir.path(), "old");
        log.append("line").unwrap();

        let removed = cleanup_expired(
            &store,
            dir.path(),
            Duration::from_secs(7 * 24 * 60 * 60),
        )
        .unwrap();
        assert_eq!(removed, vec!["old"]);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
        assert!(log.read_lines().unwrap().is_empty());
    }
}
