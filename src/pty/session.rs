//! PTY session management for interactive agent processes.
//!
//! Wraps exactly one child process behind a pseudo-terminal. Output chunks
//! flow into the session's [`RingBuffer`] and out to registered data
//! listeners; process exit is reported to exit listeners exactly once.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::ring_buffer::RingBuffer;

/// Identifier returned by listener registration, used for removal.
pub type SubscriptionId = u64;

/// Errors for session protocol violations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("PTY session already spawned")]
    AlreadySpawned,
    #[error("PTY session not spawned")]
    NotSpawned,
}

/// How the child process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i32,
    pub signal: Option<String>,
}

/// Configuration for a new PTY session
#[derive(Debug, Clone)]
pub struct PtySessionOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub buffer_capacity: usize,
}

impl Default for PtySessionOptions {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            cols: 120,
            rows: 40,
            buffer_capacity: 10_000,
        }
    }
}

type DataListener = Box<dyn Fn(&str) + Send>;
type ExitListener = Box<dyn Fn(&ExitStatus) + Send>;

/// A child process running inside a pseudo-terminal.
///
/// All methods are callable from any thread; listener dispatch happens on
/// the internal reader thread and is panic-isolated per listener.
pub struct PtySession {
    options: PtySessionOptions,
    buffer: Arc<Mutex<RingBuffer>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    pid: Mutex<Option<u32>>,
    running: Arc<AtomicBool>,
    spawned: AtomicBool,
    exit_status: Arc<Mutex<Option<ExitStatus>>>,
    next_subscription: AtomicU64,
    data_listeners: Arc<Mutex<Vec<(SubscriptionId, DataListener)>>>,
    exit_listeners: Arc<Mutex<Vec<(SubscriptionId, ExitListener)>>>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("options", &self.options)
            .field("running", &self.running)
            .field("spawned", &self.spawned)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    pub fn new(options: PtySessionOptions) -> Self {
        let capacity = options.buffer_capacity;
        Self {
            options,
            buffer: Arc::new(Mutex::new(RingBuffer::new(capacity))),
            master: Mutex::new(None),
            writer: Mutex::new(None),
            killer: Mutex::new(None),
            pid: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            spawned: AtomicBool::new(false),
            exit_status: Arc::new(Mutex::new(None)),
            next_subscription: AtomicU64::new(1),
            data_listeners: Arc::new(Mutex::new(Vec::new())),
            exit_listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the child process and begin forwarding output.
    ///
    /// Fails if called twice on the same session.
    pub fn spawn(&self) -> Result<()> {
        if self.spawned.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadySpawned.into());
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: self.options.rows,
                cols: self.options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&self.options.command);
        cmd.args(&self.options.args);
        if let Some(cwd) = &self.options.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &self.options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn command in PTY")?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = child.process_id();
        *self.killer.lock().unwrap_or_else(|e| e.into_inner()) = Some(child.clone_killer());
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);
        *self.master.lock().unwrap_or_else(|e| e.into_inner()) = Some(pair.master);
        self.running.store(true, Ordering::SeqCst);

        // Reader thread: forward output until EOF, then reap the child and
        // report the exit exactly once.
        let buffer = self.buffer.clone();
        let running = self.running.clone();
        let exit_status = self.exit_status.clone();
        let data_listeners = self.data_listeners.clone();
        let exit_listeners = self.exit_listeners.clone();
        thread::spawn(move || {
            let mut reader = reader;
            let mut chunk = [0u8; 8192];

            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&chunk[..n]).into_owned();
                        if let Ok(mut buf) = buffer.lock() {
                            buf.push_raw(&data);
                        }
                        dispatch(&data_listeners, &data);
                    }
                }
            }

            let status = match child.wait() {
                Ok(status) => ExitStatus {
                    exit_code: status.exit_code() as i32,
                    signal: status.signal().map(|s| s.to_string()),
                },
                Err(err) => {
                    tracing::warn!("Failed to reap PTY child: {}", err);
                    ExitStatus {
                        exit_code: -1,
                        signal: None,
                    }
                }
            };

            if let Ok(mut buf) = buffer.lock() {
                buf.flush();
            }
            running.store(false, Ordering::SeqCst);
            *exit_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status.clone());
            dispatch(&exit_listeners, &status);
        });

        Ok(())
    }

    /// Write bytes to the process's input side.
    pub fn write(&self, data: &str) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or(SessionError::NotSpawned)?;
        writer
            .write_all(data.as_bytes())
            .context("Failed to write to PTY")?;
        writer.flush().context("Failed to flush PTY writer")?;
        Ok(())
    }

    /// Update the live terminal geometry.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let guard = self.master.lock().unwrap_or_else(|e| e.into_inner());
        let master = guard.as_ref().ok_or(SessionError::NotSpawned)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to resize PTY")?;
        Ok(())
    }

    /// Send a signal to the child. No-op if the process already exited.
    pub fn kill(&self, signal: i32) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            let rc = unsafe { libc::kill(pid as i32, signal) };
            if rc != 0 {
                tracing::warn!("kill({}, {}) failed: {}", pid, signal, std::io::Error::last_os_error());
            }
            return Ok(());
        }

        // Fallback path: platforms without signal numbers get a hard kill
        let mut guard = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(killer) = guard.as_mut() {
            let _ = killer.kill();
        }
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Full ring-buffer contents joined as one string, for catching up a
    /// newly attaching viewer.
    pub fn buffered_output(&self) -> String {
        self.buffer
            .lock()
            .map(|b| b.raw_content())
            .unwrap_or_default()
    }

    /// All buffered lines, oldest first.
    pub fn buffer_lines(&self) -> Vec<String> {
        self.buffer.lock().map(|b| b.get_all()).unwrap_or_default()
    }

    /// The last `n` buffered lines.
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        self.buffer
            .lock()
            .map(|b| b.get_last(n))
            .unwrap_or_default()
    }

    /// Register a listener for output chunks.
    pub fn on_data(&self, listener: impl Fn(&str) + Send + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.data_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(listener)));
        id
    }

    pub fn remove_data_listener(&self, id: SubscriptionId) {
        self.data_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sid, _)| *sid != id);
    }

    /// Register a listener for process exit. Fires exactly once: a
    /// listener registered after the process has already exited is invoked
    /// immediately with the stored status instead of never.
    pub fn on_exit(&self, listener: impl Fn(&ExitStatus) + Send + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.exit_listeners.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the listener lock. The reader thread stores the
        // status before taking this lock to dispatch, so a late
        // registration either sees the status here or is covered there.
        let exited = self
            .exit_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(status) = exited {
            drop(guard);
            if catch_unwind(AssertUnwindSafe(|| listener(&status))).is_err() {
                tracing::warn!("PTY session listener {} panicked", id);
            }
            return id;
        }
        guard.push((id, Box::new(listener)));
        id
    }

    pub fn remove_exit_listener(&self, id: SubscriptionId) {
        self.exit_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sid, _)| *sid != id);
    }
}

/// Invoke every listener, isolating panics so one bad subscriber cannot
/// starve the rest.
fn dispatch<T: ?Sized>(
    listeners: &Arc<Mutex<Vec<(SubscriptionId, Box<dyn Fn(&T) + Send>)>>>,
    arg: &T,
) {
    let guard = listeners.lock().unwrap_or_else(|e| e.into_inner());
    for (id, listener) in guard.iter() {
        if catch_unwind(AssertUnwindSafe(|| listener(arg))).is_err() {
            tracing::warn!("PTY session listener {} panicked", id);
        }
    }
}
