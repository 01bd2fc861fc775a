//! Conductor - single-host orchestrator for interactive AI coding agents.
//!
//! Conductor runs multiple coding-agent CLIs (like Claude Code) inside
//! independent pseudo-terminals under a concurrency cap. Each agent gets a
//! lifecycle state machine, a heuristic status detector reading its
//! terminal output, and a durable record that survives orchestrator
//! restarts. An operator can attach to any agent's terminal tmux-style
//! (prefix key, detach, kill) without disturbing the others.
//!
//! The main entry point is [`agent::AgentController`]; the building blocks
//! (PTY session, ring buffer, detector, prefix-key protocol) are usable on
//! their own.

pub mod agent;
pub mod attach;
pub mod config;
pub mod detector;
pub mod domain;
pub mod pty;

pub use domain::*;
