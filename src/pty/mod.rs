//! Pseudo-terminal sessions for interactive agent processes.
//!
//! A [`PtySession`] owns one child process attached to a PTY and forwards
//! its output into a [`RingBuffer`] plus any registered listeners. The ring
//! buffer is what lets a late-attaching viewer catch up on scrollback.

mod ring_buffer;
mod session;

pub use ring_buffer::RingBuffer;
pub use session::{ExitStatus, PtySession, PtySessionOptions, SubscriptionId};
