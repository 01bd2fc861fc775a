//! Incremental analysis of an agent's output stream.
//!
//! Feeds each complete line through the [`StreamEvent`] decoder and folds
//! the interesting events into the agent's usage metrics.

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::domain::{AgentMetrics, StreamEvent};

/// Tool input keys that name a file the agent touched
const FILE_PATH_KEYS: &[&str] = &["file_path", "path", "filename", "notebook_path"];

/// One completed output line with its decoded event
#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub raw: String,
    pub event: StreamEvent,
}

#[derive(Default)]
struct AnalyzerState {
    partial: String,
    tool_calls: u64,
    files_modified: BTreeSet<String>,
    saw_result: bool,
}

/// Accumulates metrics from raw output chunks.
///
/// Chunks may split lines arbitrarily; the analyzer buffers the trailing
/// fragment the same way the ring buffer does.
#[derive(Default)]
pub struct OutputAnalyzer {
    state: Mutex<AnalyzerState>,
}

impl OutputAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one raw chunk; returns the lines it completed together with
    /// their decoded events.
    pub fn feed(&self, chunk: &str) -> Vec<ParsedLine> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = Vec::new();

        let combined = format!("{}{}", state.partial, chunk);
        let mut parts: Vec<&str> = combined.split('\n').collect();
        let partial = parts.pop().unwrap_or("").to_string();

        for line in parts {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let event = StreamEvent::parse_line(line);
            apply(&mut state, &event);
            lines.push(ParsedLine {
                raw: line.to_string(),
                event,
            });
        }

        state.partial = partial;
        lines
    }

    /// Decode and fold any buffered trailing fragment.
    pub fn flush(&self) -> Option<ParsedLine> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let partial = std::mem::take(&mut state.partial);
        let trimmed = partial.trim();
        if trimmed.is_empty() {
            return None;
        }
        let event = StreamEvent::parse_line(trimmed);
        apply(&mut state, &event);
        Some(ParsedLine {
            raw: trimmed.to_string(),
            event,
        })
    }

    /// Whether a terminal result record has been seen.
    pub fn saw_result(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .saw_result
    }

    /// Snapshot the accumulated metrics. Duration is owned by the
    /// orchestrator and left unset here.
    pub fn metrics(&self) -> AgentMetrics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        AgentMetrics {
            tool_calls: state.tool_calls,
            files_modified: state.files_modified.iter().cloned().collect(),
            duration_ms: None,
        }
    }
}

fn apply(state: &mut AnalyzerState, event: &StreamEvent) {
    match event {
        StreamEvent::ToolUse { input, .. } => {
            state.tool_calls += 1;
            if let Some(path) = extract_file_path(input) {
                state.files_modified.insert(path);
            }
        }
        StreamEvent::Result { .. } => state.saw_result = true,
        _ => {}
    }
}

fn extract_file_path(input: &Value) -> Option<String> {
    FILE_PATH_KEYS
        .iter()
        .find_map(|key| input.get(key).and_then(Value::as_str))
        .map(|s| s.to_string())
}
