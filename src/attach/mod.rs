//! tmux-like attach/detach for agent PTY sessions.
//!
//! [`PrefixKeyHandler`] splits operator keystrokes into passthrough bytes
//! and protocol commands; [`AttachSession`] wires a handler onto one live
//! PTY session, taking care of terminal raw-mode save/restore and
//! scrollback replay.

mod prefix;
mod session;

pub use prefix::{
    format_key_notation, parse_key_notation, PrefixCommand, PrefixKeyHandler,
    DEFAULT_PREFIX_KEY, DEFAULT_PREFIX_TIMEOUT_MS,
};
pub use session::{AttachOptions, AttachSession};
