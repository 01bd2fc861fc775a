//! Heuristic status detection from raw terminal output.
//!
//! Interactive agent CLIs render spinners, prompts and confirmation dialogs
//! rather than structured status records, so the detector classifies raw
//! output with regex pattern sets. Classification priority is
//! waiting_input > running > idle; a debounce window collapses bursts of
//! alternating signals (spinner frames interleaved with prompts) into a
//! single transition.

use once_cell::sync::Lazy;
use regex::Regex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::domain::DetectedStatus;

/// Default debounce window before committing a detected status change
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Default auto-detection pause after a manual override
pub const DEFAULT_OVERRIDE_PAUSE_MS: u64 = 30_000;

/// Characters of recent output retained for inspection
const OUTPUT_BUFFER_MAX: usize = 2000;

/// Ordered pattern sets for one agent CLI
#[derive(Debug, Clone, Default)]
pub struct StatusPatterns {
    pub waiting_input: Vec<Regex>,
    pub running: Vec<Regex>,
    pub idle: Vec<Regex>,
}

static CLAUDE_CODE_PATTERNS: Lazy<StatusPatterns> = Lazy::new(|| StatusPatterns {
    waiting_input: compile(&[
        r"(?i)\(y/n\)",
        r"\[Y/n\]",
        r"\[y/N\]",
        r"(?i)Continue\?",
        r"(?i)Confirm",
        r"(?i)Press.*to continue",
        r"(?i)Do you want to",
        r"(?i)Would you like to",
        r"(?i)Enter.*:",
        r"(?i)Permission.*\?",
    ]),
    running: compile(&[
        r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
        r"\.\.\.$",
        r"Loading",
        r"Processing",
        r"Running",
    ]),
    idle: compile(&[r"❯\s*$", r">\s*$", r"\$\s*$", r"(?i)claude>\s*$"]),
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("invalid built-in status pattern"))
        .collect()
}

type StatusListener = Box<dyn Fn(DetectedStatus, DetectedStatus) + Send>;

struct DetectorState {
    current: DetectedStatus,
    pending: Option<DetectedStatus>,
    override_until: Option<Instant>,
    output_buffer: String,
}

/// Classifies a session's raw output into a [`DetectedStatus`].
///
/// Shareable across threads; `feed` is typically called from a PTY reader
/// thread while `override_status`/`reset` come from the orchestrator.
pub struct PatternStatusDetector {
    patterns: StatusPatterns,
    debounce: Duration,
    state: Arc<Mutex<DetectorState>>,
    listeners: Arc<Mutex<Vec<(u64, StatusListener)>>>,
    next_listener_id: AtomicU64,
    /// Bumped on every reschedule/override/reset; a timer only commits if
    /// its generation is still current when it fires.
    generation: Arc<AtomicU64>,
}

impl PatternStatusDetector {
    pub fn new(patterns: StatusPatterns, debounce_ms: u64) -> Self {
        Self {
            patterns,
            debounce: Duration::from_millis(debounce_ms),
            state: Arc::new(Mutex::new(DetectorState {
                current: DetectedStatus::Unknown,
                pending: None,
                override_until: None,
                output_buffer: String::new(),
            })),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Detector preconfigured for Claude Code terminal output.
    pub fn claude_code(debounce_ms: u64) -> Self {
        Self::new(CLAUDE_CODE_PATTERNS.clone(), debounce_ms)
    }

    /// Feed a chunk of raw terminal output.
    pub fn feed(&self, data: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(until) = state.override_until {
            if Instant::now() < until {
                return;
            }
            state.override_until = None;
        }

        state.output_buffer.push_str(data);
        if state.output_buffer.len() > OUTPUT_BUFFER_MAX {
            let excess = state.output_buffer.len() - OUTPUT_BUFFER_MAX;
            let cut = (excess..state.output_buffer.len())
                .find(|i| state.output_buffer.is_char_boundary(*i))
                .unwrap_or(0);
            state.output_buffer.drain(..cut);
        }

        let detected = self.classify(data);
        if detected == DetectedStatus::Unknown || detected == state.current {
            return;
        }

        // Replace any pending target; only the value pending when the timer
        // fires is committed.
        state.pending = Some(detected);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(state);

        let state_ref = self.state.clone();
        let generation_ref = self.generation.clone();
        let listeners = self.listeners.clone();
        let debounce = self.debounce;
        thread::spawn(move || {
            thread::sleep(debounce);
            if generation_ref.load(Ordering::SeqCst) != generation {
                return; // superseded or reset while we slept
            }

            let commit = {
                let mut state = state_ref.lock().unwrap_or_else(|e| e.into_inner());
                if generation_ref.load(Ordering::SeqCst) != generation {
                    None
                } else {
                    match state.pending.take() {
                        Some(next) if next != state.current => {
                            let old = state.current;
                            state.current = next;
                            Some((next, old))
                        }
                        _ => None,
                    }
                }
            };

            if let Some((new, old)) = commit {
                notify(&listeners, new, old);
            }
        });
    }

    /// Classify one chunk in strict priority order.
    fn classify(&self, data: &str) -> DetectedStatus {
        if matches_any(&self.patterns.waiting_input, data) {
            DetectedStatus::WaitingInput
        } else if matches_any(&self.patterns.running, data) {
            DetectedStatus::Running
        } else if matches_any(&self.patterns.idle, data) {
            DetectedStatus::Idle
        } else {
            DetectedStatus::Unknown
        }
    }

    pub fn current_status(&self) -> DetectedStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).current
    }

    /// Manually commit a status, bypassing debounce, and pause
    /// auto-detection for `pause_ms` (operator correction).
    pub fn override_status(&self, status: DetectedStatus, pause_ms: Option<u64>) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let changed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending = None;
            state.override_until = Some(
                Instant::now()
                    + Duration::from_millis(pause_ms.unwrap_or(DEFAULT_OVERRIDE_PAUSE_MS)),
            );

            let old = state.current;
            state.current = status;
            (status != old).then_some(old)
        };

        if let Some(old) = changed {
            notify(&self.listeners, status, old);
        }
    }

    /// Whether auto-detection is currently suppressed by an override.
    pub fn is_paused(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .override_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Clear status, pending timer, pause and output buffer.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.current = DetectedStatus::Unknown;
        state.pending = None;
        state.override_until = None;
        state.output_buffer.clear();
    }

    /// Recent output retained for inspection.
    pub fn output_buffer(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .output_buffer
            .clone()
    }

    /// Register a status-change listener; returns an id usable for removal.
    pub fn on_status_change(
        &self,
        listener: impl Fn(DetectedStatus, DetectedStatus) + Send + 'static,
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

fn matches_any(patterns: &[Regex], data: &str) -> bool {
    patterns.iter().any(|p| p.is_match(data))
}

fn notify(
    listeners: &Arc<Mutex<Vec<(u64, StatusListener)>>>,
    new: DetectedStatus,
    old: DetectedStatus,
) {
    let guard = listeners.lock().unwrap_or_else(|e| e.into_inner());
    for (id, listener) in guard.iter() {
        if catch_unwind(AssertUnwindSafe(|| listener(new, old))).is_err() {
            tracing::warn!("Status listener {} panicked", id);
        }
    }
}
