use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Default prefix key (Ctrl+], like telnet's escape)
pub const DEFAULT_PREFIX_KEY: &str = "C-]";

/// Default wait for a command key after the prefix before the default
/// command (detach) fires
pub const DEFAULT_PREFIX_TIMEOUT_MS: u64 = 500;

/// Commands reachable through the prefix key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixCommand {
    /// Return control to the operator's own terminal
    Detach,
    /// Switch to the next agent
    NextAgent,
    /// Switch to the previous agent
    PrevAgent,
    /// Kill the attached agent
    KillAgent,
    /// Show the command help overlay
    Help,
}

/// Parse tmux-style key notation ("C-]", "C-b") into the control byte it
/// produces on the wire.
pub fn parse_key_notation(notation: &str) -> Option<u8> {
    let rest = notation
        .strip_prefix("C-")
        .or_else(|| notation.strip_prefix("c-"))?;
    let mut chars = rest.chars();
    let key = chars.next()?;
    if chars.next().is_some() {
        return None;
    }

    match key {
        // Ctrl+] is GS (0x1d), Ctrl+\ is FS, Ctrl+^ / Ctrl+_ likewise
        ']' => Some(0x1d),
        '\\' => Some(0x1c),
        '^' => Some(0x1e),
        '_' => Some(0x1f),
        c if c.is_ascii_alphabetic() => Some((c.to_ascii_uppercase() as u8) - b'@'),
        _ => None,
    }
}

/// Human-readable form of a key notation for help text
pub fn format_key_notation(notation: &str) -> String {
    match notation
        .strip_prefix("C-")
        .or_else(|| notation.strip_prefix("c-"))
    {
        Some(rest) => format!("Ctrl+{}", rest),
        None => notation.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Normal,
    PrefixPending,
}

type CommandListener = Box<dyn Fn(PrefixCommand) + Send>;
type PassthroughListener = Box<dyn Fn(&[u8]) + Send>;

/// tmux-style prefix key multiplexer.
///
/// Splits an operator's raw keystroke stream into bytes passed through to
/// the attached agent and protocol commands introduced by the prefix key.
/// Pressing the prefix twice sends one literal prefix byte; an unanswered
/// prefix fires the default command (detach) after the timeout.
pub struct PrefixKeyHandler {
    prefix_byte: u8,
    timeout: Duration,
    state: Arc<Mutex<HandlerState>>,
    command_listeners: Arc<Mutex<Vec<(u64, CommandListener)>>>,
    passthrough_listeners: Arc<Mutex<Vec<(u64, PassthroughListener)>>>,
    next_listener_id: AtomicU64,
    /// Bumped whenever the pending state resolves; a timeout thread only
    /// acts if its generation is still current.
    generation: Arc<AtomicU64>,
}

impl PrefixKeyHandler {
    pub fn new(key_notation: &str, timeout_ms: u64) -> anyhow::Result<Self> {
        let prefix_byte = parse_key_notation(key_notation)
            .ok_or_else(|| anyhow::anyhow!("Invalid prefix key notation: {}", key_notation))?;

        Ok(Self {
            prefix_byte,
            timeout: Duration::from_millis(timeout_ms),
            state: Arc::new(Mutex::new(HandlerState::Normal)),
            command_listeners: Arc::new(Mutex::new(Vec::new())),
            passthrough_listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Process raw operator input one byte at a time.
    pub fn feed(&self, data: &[u8]) {
        for &byte in data {
            self.feed_byte(byte);
        }
    }

    fn feed_byte(&self, byte: u8) {
        enum Action {
            None,
            Passthrough(u8),
            Command(PrefixCommand),
        }

        let action = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                HandlerState::Normal => {
                    if byte == self.prefix_byte {
                        *state = HandlerState::PrefixPending;
                        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                        self.start_timeout(generation);
                        Action::None
                    } else {
                        Action::Passthrough(byte)
                    }
                }
                HandlerState::PrefixPending => {
                    // Any resolution cancels the pending timeout
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    *state = HandlerState::Normal;

                    if byte == self.prefix_byte {
                        // Double prefix: one literal prefix byte goes through
                        Action::Passthrough(byte)
                    } else if let Some(command) = parse_command(byte) {
                        Action::Command(command)
                    } else {
                        // Unrecognized command keys are silently dropped
                        Action::None
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::Passthrough(byte) => self.emit_passthrough(&[byte]),
            Action::Command(command) => self.emit_command(command),
        }
    }

    fn start_timeout(&self, generation: u64) {
        let state_ref = self.state.clone();
        let generation_ref = self.generation.clone();
        let listeners = self.command_listeners.clone();
        let timeout = self.timeout;
        thread::spawn(move || {
            thread::sleep(timeout);
            if generation_ref.load(Ordering::SeqCst) != generation {
                return;
            }

            {
                let mut state = state_ref.lock().unwrap_or_else(|e| e.into_inner());
                if generation_ref.load(Ordering::SeqCst) != generation
                    || *state != HandlerState::PrefixPending
                {
                    return;
                }
                *state = HandlerState::Normal;
            }
            dispatch_command(&listeners, PrefixCommand::Detach);
        });
    }

    /// Cancel any pending prefix and return to the normal state.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = HandlerState::Normal;
    }

    /// Whether a prefix has been seen and a command key is awaited.
    pub fn is_prefix_pending(&self) -> bool {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) == HandlerState::PrefixPending
    }

    pub fn on_command(&self, listener: impl Fn(PrefixCommand) + Send + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.command_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(listener)));
        id
    }

    pub fn on_passthrough(&self, listener: impl Fn(&[u8]) + Send + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.passthrough_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(listener)));
        id
    }

    fn emit_command(&self, command: PrefixCommand) {
        dispatch_command(&self.command_listeners, command);
    }

    fn emit_passthrough(&self, data: &[u8]) {
        let guard = self
            .passthrough_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (id, listener) in guard.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(data))).is_err() {
                tracing::warn!("Prefix passthrough listener {} panicked", id);
            }
        }
    }

    /// Help text describing the prefix commands.
    pub fn help_text(key_notation: &str) -> String {
        let prefix = format_key_notation(key_notation);
        format!(
            "\r\nAttach mode - prefix key commands\r\n\
             =================================\r\n\
             {p}          detach (also fires on prefix timeout)\r\n\
             {p} d        detach\r\n\
             {p} n        next agent\r\n\
             {p} p        previous agent\r\n\
             {p} k        kill current agent\r\n\
             {p} ?        show this help\r\n\
             {p} {p}   send a literal {p} to the agent\r\n",
            p = prefix
        )
    }
}

fn dispatch_command(
    listeners: &Arc<Mutex<Vec<(u64, CommandListener)>>>,
    command: PrefixCommand,
) {
    let guard = listeners.lock().unwrap_or_else(|e| e.into_inner());
    for (id, listener) in guard.iter() {
        if catch_unwind(AssertUnwindSafe(|| listener(command))).is_err() {
            tracing::warn!("Prefix command listener {} panicked", id);
        }
    }
}

fn parse_command(byte: u8) -> Option<PrefixCommand> {
    match byte.to_ascii_lowercase() {
        b'd' => Some(PrefixCommand::Detach),
        b'n' => Some(PrefixCommand::NextAgent),
        b'p' => Some(PrefixCommand::PrevAgent),
        b'k' => Some(PrefixCommand::KillAgent),
        b'?' => Some(PrefixCommand::Help),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const PREFIX: u8 = 0x1d; // C-]

    fn handler(
        timeout_ms: u64,
    ) -> (
        PrefixKeyHandler,
        mpsc::Receiver<PrefixCommand>,
        mpsc::Receiver<Vec<u8>>,
    ) {
        let h = PrefixKeyHandler::new("C-]", timeout_ms).unwrap();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (pass_tx, pass_rx) = mpsc::channel();
        h.on_command(move |c| {
            let _ = cmd_tx.send(c);
        });
        h.on_passthrough(move |d| {
            let _ = pass_tx.send(d.to_vec());
        });
        (h, cmd_rx, pass_rx)
    }

    #[test]
    fn parses_key_notation() {
        assert_eq!(parse_key_notation("C-]"), Some(0x1d));
        assert_eq!(parse_key_notation("C-b"), Some(0x02));
        assert_eq!(parse_key_notation("C-A"), Some(0x01));
        assert_eq!(parse_key_notation("x"), None);
        assert_eq!(parse_key_notation("C-"), None);
        assert_eq!(format_key_notation("C-]"), "Ctrl+]");
    }

    #[test]
    fn ordinary_bytes_pass_through() {
        let (h, cmd_rx, pass_rx) = handler(10_000);
        h.feed(b"ls\r");

        let mut got = Vec::new();
        for _ in 0..3 {
            got.extend(pass_rx.recv_timeout(Duration::from_secs(1)).unwrap());
        }
        assert_eq!(got, b"ls\r");
        assert!(cmd_rx.try_recv().is_err());
    }

    #[test]
    fn prefix_then_d_detaches() {
        let (h, cmd_rx, pass_rx) = handler(10_000);
        h.feed(&[PREFIX]);
        assert!(h.is_prefix_pending());
        h.feed(b"d");

        assert_eq!(
            cmd_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PrefixCommand::Detach
        );
        assert!(pass_rx.try_recv().is_err());
        assert!(!h.is_prefix_pending());
    }

    #[test]
    fn command_keys_are_case_insensitive() {
        let (h, cmd_rx, _pass_rx) = handler(10_000);
        h.feed(&[PREFIX]);
        h.feed(b"K");
        assert_eq!(
            cmd_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PrefixCommand::KillAgent
        );
    }

    #[test]
    fn double_prefix_passes_one_literal_prefix() {
        let (h, cmd_rx, pass_rx) = handler(10_000);
        h.feed(&[PREFIX, PREFIX]);

        assert_eq!(
            pass_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            vec![PREFIX]
        );
        assert!(pass_rx.try_recv().is_err());
        assert!(cmd_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn unrecognized_command_key_is_dropped() {
        let (h, cmd_rx, pass_rx) = handler(10_000);
        h.feed(&[PREFIX]);
        h.feed(b"z");

        assert!(cmd_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(pass_rx.try_recv().is_err());
        assert!(!h.is_prefix_pending());
    }

    #[test]
    fn timeout_fires_default_detach() {
        let (h, cmd_rx, _pass_rx) = handler(30);
        h.feed(&[PREFIX]);

        assert_eq!(
            cmd_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            PrefixCommand::Detach
        );
        assert!(!h.is_prefix_pending());
    }

    #[test]
    fn reset_cancels_pending_timeout() {
        let (h, cmd_rx, _pass_rx) = handler(30);
        h.feed(&[PREFIX]);
        h.reset();

        assert!(cmd_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(!h.is_prefix_pending());
    }
}
