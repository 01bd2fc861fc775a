use anyhow::Result;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::pty::{PtySession, SubscriptionId};

use super::prefix::{
    PrefixCommand, PrefixKeyHandler, DEFAULT_PREFIX_KEY, DEFAULT_PREFIX_TIMEOUT_MS,
};

/// Options for an attach session
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Prefix key in tmux notation (e.g. "C-]")
    pub prefix_key: String,
    /// How long to wait for a command key after the prefix
    pub prefix_timeout_ms: u64,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            prefix_key: DEFAULT_PREFIX_KEY.to_string(),
            prefix_timeout_ms: DEFAULT_PREFIX_TIMEOUT_MS,
        }
    }
}

type CommandObserver = Box<dyn Fn(PrefixCommand) + Send>;

/// Full-screen attach to one live PTY session.
///
/// `attach()` saves the operator's terminal mode, switches to raw mode,
/// replays the session's scrollback and wires keystrokes through the
/// prefix-key handler into the agent. `detach()` reverses everything and
/// is safe to call from any state, any number of times.
///
/// The operator-side output is an injected writer so the session can be
/// driven headless in tests.
pub struct AttachSession {
    session: Arc<PtySession>,
    prefix: PrefixKeyHandler,
    prefix_key: String,
    output: Arc<Mutex<Box<dyn Write + Send>>>,
    attached: AtomicBool,
    saved_raw_mode: AtomicBool,
    data_subscription: Mutex<Option<SubscriptionId>>,
    next_observer_id: AtomicU64,
    observers: Arc<Mutex<Vec<(u64, CommandObserver)>>>,
}

impl AttachSession {
    pub fn new(
        session: Arc<PtySession>,
        output: Box<dyn Write + Send>,
        options: AttachOptions,
    ) -> Result<Arc<Self>> {
        let prefix = PrefixKeyHandler::new(&options.prefix_key, options.prefix_timeout_ms)?;

        let this = Arc::new(Self {
            session,
            prefix,
            prefix_key: options.prefix_key,
            output: Arc::new(Mutex::new(output)),
            attached: AtomicBool::new(false),
            saved_raw_mode: AtomicBool::new(false),
            data_subscription: Mutex::new(None),
            next_observer_id: AtomicU64::new(1),
            observers: Arc::new(Mutex::new(Vec::new())),
        });

        // Keystrokes that are not protocol commands go straight to the agent
        let weak: Weak<AttachSession> = Arc::downgrade(&this);
        this.prefix.on_passthrough(move |bytes| {
            if let Some(this) = weak.upgrade() {
                if this.is_attached() && this.session.is_running() {
                    let data = String::from_utf8_lossy(bytes);
                    if let Err(err) = this.session.write(&data) {
                        tracing::warn!("Failed to forward input to agent: {}", err);
                    }
                }
            }
        });

        let weak: Weak<AttachSession> = Arc::downgrade(&this);
        this.prefix.on_command(move |command| {
            if let Some(this) = weak.upgrade() {
                this.handle_command(command);
            }
        });

        Ok(this)
    }

    fn handle_command(&self, command: PrefixCommand) {
        match command {
            PrefixCommand::Detach => self.detach(),
            PrefixCommand::Help => {
                let help = PrefixKeyHandler::help_text(&self.prefix_key);
                self.write_output(help.as_bytes());
            }
            // Next/prev/kill are decided by whoever embeds the session
            _ => {}
        }

        let guard = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        for (id, observer) in guard.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(command))).is_err() {
                tracing::warn!("Attach command observer {} panicked", id);
            }
        }
    }

    /// Begin the attached state: raw mode, screen clear, scrollback replay,
    /// and I/O wiring. No-op if already attached.
    pub fn attach(&self) -> Result<()> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Save the caller's terminal mode before forcing raw
        let was_raw = crossterm::terminal::is_raw_mode_enabled().unwrap_or(false);
        self.saved_raw_mode.store(was_raw, Ordering::SeqCst);
        if !was_raw {
            if let Err(err) = crossterm::terminal::enable_raw_mode() {
                // Not fatal: tests and pipes have no controlling terminal
                tracing::debug!("Could not enable raw mode: {}", err);
            }
        }

        // Clear screen, home cursor, replay scrollback
        self.write_output(b"\x1b[2J\x1b[H");
        let backlog = self.session.buffered_output();
        if !backlog.is_empty() {
            self.write_output(backlog.as_bytes());
        }

        // Live output flows straight to the operator
        let output = self.output.clone();
        let id = self.session.on_data(move |data| {
            let mut out = output.lock().unwrap_or_else(|e| e.into_inner());
            let _ = out.write_all(data.as_bytes());
            let _ = out.flush();
        });
        *self
            .data_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(id);

        Ok(())
    }

    /// Undo everything `attach` did. Idempotent and safe from any state.
    pub fn detach(&self) {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(id) = self
            .data_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.session.remove_data_listener(id);
        }

        self.prefix.reset();

        if !self.saved_raw_mode.load(Ordering::SeqCst) {
            if let Err(err) = crossterm::terminal::disable_raw_mode() {
                tracing::debug!("Could not restore terminal mode: {}", err);
            }
        }
    }

    /// Feed raw operator keystrokes. Ignored when not attached.
    pub fn feed_input(&self, data: &[u8]) {
        if self.is_attached() {
            self.prefix.feed(data);
        }
    }

    /// Propagate an operator terminal resize to the agent's PTY.
    pub fn handle_resize(&self, cols: u16, rows: u16) {
        if self.is_attached() && self.session.is_running() {
            if let Err(err) = self.session.resize(cols, rows) {
                tracing::warn!("Failed to resize agent PTY: {}", err);
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Observe protocol commands (next/prev/kill/help/detach) so the
    /// embedder can act on them.
    pub fn on_command(&self, observer: impl Fn(PrefixCommand) + Send + 'static) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(observer)));
        id
    }

    fn write_output(&self, bytes: &[u8]) {
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }
}

impl Drop for AttachSession {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtySessionOptions;
    use std::sync::mpsc;
    use std::time::Duration;

    const PREFIX: u8 = 0x1d;

    #[derive(Clone)]
    struct SinkWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SinkWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sink() -> (SinkWriter, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        (SinkWriter(data.clone()), data)
    }

    fn spawn_shell(script: &str) -> Arc<PtySession> {
        let session = Arc::new(PtySession::new(PtySessionOptions {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }));
        session.spawn().unwrap();
        session
    }

    fn wait_for_exit(session: &Arc<PtySession>) {
        let (tx, rx) = mpsc::channel();
        session.on_exit(move |_| {
            let _ = tx.send(());
        });
        if session.is_running() {
            let _ = rx.recv_timeout(Duration::from_secs(10));
        }
    }

    #[test]
    fn attach_replays_buffered_output() {
        let session = spawn_shell("echo backlog-line");
        wait_for_exit(&session);

        let (writer, data) = sink();
        let attach =
            AttachSession::new(session, Box::new(writer), AttachOptions::default()).unwrap();
        attach.attach().unwrap();

        let captured = String::from_utf8_lossy(&data.lock().unwrap()).into_owned();
        assert!(captured.contains("backlog-line"), "got: {:?}", captured);
        // Screen-clear escape precedes the replay
        assert!(captured.starts_with("\x1b[2J\x1b[H"));

        attach.detach();
        assert!(!attach.is_attached());
    }

    #[test]
    fn passthrough_reaches_the_agent() {
        let session = spawn_shell("read line; echo echoed:$line");
        let (writer, data) = sink();
        let attach =
            AttachSession::new(session.clone(), Box::new(writer), AttachOptions::default())
                .unwrap();
        attach.attach().unwrap();

        attach.feed_input(b"hi\r");
        wait_for_exit(&session);

        // Give the data listener a moment to flush the final chunk
        std::thread::sleep(Duration::from_millis(200));
        let captured = String::from_utf8_lossy(&data.lock().unwrap()).into_owned();
        assert!(captured.contains("echoed:hi"), "got: {:?}", captured);
    }

    #[test]
    fn prefix_d_detaches_and_notifies() {
        let session = spawn_shell("sleep 5");
        let (writer, _data) = sink();
        let attach =
            AttachSession::new(session.clone(), Box::new(writer), AttachOptions::default())
                .unwrap();

        let (tx, rx) = mpsc::channel();
        attach.on_command(move |c| {
            let _ = tx.send(c);
        });

        attach.attach().unwrap();
        attach.feed_input(&[PREFIX]);
        attach.feed_input(b"d");

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PrefixCommand::Detach
        );
        assert!(!attach.is_attached());

        // Input after detach is ignored
        attach.feed_input(b"x");
        session.kill(9).unwrap();
    }

    #[test]
    fn detach_is_idempotent() {
        let session = spawn_shell("sleep 5");
        let (writer, _data) = sink();
        let attach =
            AttachSession::new(session.clone(), Box::new(writer), AttachOptions::default())
                .unwrap();

        attach.detach();
        attach.attach().unwrap();
        attach.detach();
        attach.detach();
        assert!(!attach.is_attached());
        session.kill(9).unwrap();
    }
}
