//! PTY process management.
//!
//! A [`PtyProcess`] is one shell (or SSH client) attached to a pseudo-terminal.
//! Three threads serve it: a reader pumping output into a bounded channel, a
//! writer draining queued input into the PTY, and a waiter reporting the exit
//! code once the child terminates. Blocking PTY I/O never runs on the async
//! runtime.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{SessionSummary, TerminalSize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::registry::PendingRequest;
use super::shell::ShellInvocation;
use super::token::token_prefix;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A pending request with this token already exists.
    #[error("duplicate session token")]
    DuplicateToken,

    /// No pending request matches the presented token.
    #[error("unknown session token: {0}...")]
    UnknownToken(String),

    /// Pending plus live sessions reached the configured limit.
    #[error("session capacity exceeded: limit is {0}")]
    CapacityExceeded(usize),

    /// No live session matches the (pid, token) pair.
    #[error("no live session for pid {0}")]
    StaleResize(u32),

    /// The session is closing or closed.
    #[error("session already terminated: pid {0}")]
    AlreadyTerminated(u32),

    /// A terminal dimension was zero.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}

/// Lifecycle of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process running, transport attached.
    Active,
    /// Teardown started; input and resize are rejected.
    Closing,
    /// Process killed or exited.
    Closed,
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the output channel between the reader thread and the relay.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the input channel between the relay and the writer thread.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Exit code reported when the child's status could not be collected.
pub const UNKNOWN_EXIT_CODE: u32 = 1;

/// Channel ends handed to whoever relays a session.
#[derive(Debug)]
pub struct SessionIo {
    /// Input queued for the writer thread. Dropping it stops the thread.
    pub input: mpsc::Sender<Vec<u8>>,
    /// PTY output in production order. Closes once the PTY reaches EOF.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Resolves with the exit code when the child terminates.
    pub exit: oneshot::Receiver<u32>,
}

/// A shell process attached to a pseudo-terminal.
pub struct PtyProcess {
    pid: u32,
    token: String,
    username: Option<String>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    size: Mutex<TerminalSize>,
    state: Arc<Mutex<SessionState>>,
    started_at: Instant,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("token", &token_prefix(&self.token))
            .field("size", &self.size())
            .field("state", &self.state())
            .finish()
    }
}

impl PtyProcess {
    /// Spawns the invocation on a fresh PTY sized for the request.
    ///
    /// The child inherits the daemon's working directory and environment,
    /// with `TERM` set to `term_name`. A zero or missing size falls back to
    /// 80x24.
    pub fn spawn(
        request: PendingRequest,
        invocation: &ShellInvocation,
        term_name: &str,
    ) -> Result<(Arc<Self>, SessionIo), SessionError> {
        let size = request.size.or_default();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&invocation.program);
        cmd.args(&invocation.args);
        if let Ok(dir) = std::env::current_dir() {
            cmd.cwd(dir);
        }
        cmd.env("TERM", term_name);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // Only the child may hold the slave, otherwise the reader never sees EOF
        drop(pair.slave);

        let mut killer = child.clone_killer();
        let Some(pid) = child.process_id() else {
            let _ = killer.kill();
            return Err(SessionError::SpawnFailed(
                "child has no process id".to_string(),
            ));
        };

        let io_handles = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match io_handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = killer.kill();
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let state = Arc::new(Mutex::new(SessionState::Active));
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let spawned = spawn_reader(pid, reader, output_tx)
            .and_then(|_| spawn_writer(pid, writer, input_rx))
            .and_then(|_| spawn_waiter(pid, child, Arc::clone(&state), exit_tx));
        if let Err(e) = spawned {
            let _ = killer.kill();
            return Err(SessionError::SpawnFailed(e.to_string()));
        }

        let process = Arc::new(PtyProcess {
            pid,
            token: request.token,
            username: request.username,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            size: Mutex::new(size),
            state,
            started_at: Instant::now(),
        });

        tracing::info!(
            pid = pid,
            program = %invocation.program,
            cols = size.cols,
            rows = size.rows,
            "Spawned PTY process"
        );

        Ok((
            process,
            SessionIo {
                input: input_tx,
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }

    /// Returns the process ID of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the token this session was bound with.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the identity the session was created for.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the session still accepts input.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        if !size.is_valid() {
            return Err(SessionError::InvalidSize {
                cols: size.cols,
                rows: size.rows,
            });
        }
        if !self.is_active() {
            return Err(SessionError::AlreadyTerminated(self.pid));
        }

        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;

        tracing::debug!(pid = self.pid, cols = size.cols, rows = size.rows, "Resized PTY");

        Ok(())
    }

    /// Terminates the child process.
    ///
    /// Only the first call on an active session signals the process; later
    /// calls, and calls after the child already exited, return `false`.
    pub fn kill(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Active {
            return false;
        }
        *state = SessionState::Closing;

        // Holding the state lock collapses concurrent kills into one signal. The
        // waiter reaps before it stores Closed, so a kill racing a natural exit
        // may still signal the reaped pid.
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = killer.kill() {
            tracing::debug!(pid = self.pid, error = %e, "Kill signal not delivered");
        }
        *state = SessionState::Closed;

        tracing::info!(pid = self.pid, "Session killed");
        true
    }

    /// Snapshot used by status listings.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            pid: self.pid,
            size: self.size(),
            username: self.username.clone(),
            age_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Starts the thread that copies PTY output into the channel.
fn spawn_reader(
    pid: u32,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("ptyrelay-read-{}", pid))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(pid = pid, "PTY EOF");
                        break;
                    }
                    Ok(n) => {
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            tracing::trace!(pid = pid, "Output receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is the normal end of a Linux PTY once the child is gone
                        tracing::debug!(pid = pid, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        })
        .map(|_| ())
}

/// Starts the thread that reaps the child and reports its exit code.
fn spawn_waiter(
    pid: u32,
    mut child: Box<dyn Child + Send + Sync>,
    state: Arc<Mutex<SessionState>>,
    exit_tx: oneshot::Sender<u32>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("ptyrelay-wait-{}", pid))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code(),
                Err(e) => {
                    tracing::warn!(pid = pid, error = %e, "Failed to collect exit status");
                    UNKNOWN_EXIT_CODE
                }
            };
            *state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;
            tracing::debug!(pid = pid, exit_code = code, "Child process exited");
            let _ = exit_tx.send(code);
        })
        .map(|_| ())
}

/// Starts the thread that feeds queued input into the PTY.
///
/// A write blocks while the tty input queue is full; only this thread waits.
fn spawn_writer(
    pid: u32,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("ptyrelay-write-{}", pid))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    tracing::debug!(pid = pid, error = %e, "PTY write ended");
                    break;
                }
            }
            tracing::trace!(pid = pid, "PTY writer stopped");
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh() -> ShellInvocation {
        ShellInvocation::new("/bin/sh", Vec::new())
    }

    fn spawn_sh(size: TerminalSize) -> (Arc<PtyProcess>, SessionIo) {
        let request = PendingRequest::new("test-token".to_string(), size);
        PtyProcess::spawn(request, &sh(), "xterm-color").unwrap()
    }

    async fn wait_for_output(io: &mut SessionIo, marker: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), io.output.recv()).await {
                Ok(Some(data)) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    if seen.contains(marker) {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_spawn() {
        let (process, _io) = spawn_sh(TerminalSize::new(100, 30));

        assert!(process.pid() > 0);
        assert!(process.is_active());
        assert_eq!(process.size(), TerminalSize::new(100, 30));
        assert_eq!(process.token(), "test-token");

        process.kill();
    }

    #[tokio::test]
    async fn test_spawn_zero_size_uses_default() {
        let (process, _io) = spawn_sh(TerminalSize::new(0, 0));
        assert_eq!(process.size(), TerminalSize::new(80, 24));
        process.kill();
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let request = PendingRequest::new("t".to_string(), TerminalSize::default());
        let invocation = ShellInvocation::new("/nonexistent/ptyrelay-shell", Vec::new());
        let result = PtyProcess::spawn(request, &invocation, "xterm-color");
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_write_and_read_output() {
        let (process, mut io) = spawn_sh(TerminalSize::default());

        io.input.send(b"echo test_output_marker\n".to_vec()).await.unwrap();
        assert!(
            wait_for_output(&mut io, "test_output_marker").await,
            "Did not receive expected output"
        );

        process.kill();
    }

    #[tokio::test]
    async fn test_term_name_exported() {
        let (process, mut io) = spawn_sh(TerminalSize::default());

        io.input.send(b"echo term=$TERM\n".to_vec()).await.unwrap();
        assert!(wait_for_output(&mut io, "term=xterm-color").await);

        process.kill();
    }

    #[tokio::test]
    async fn test_resize() {
        let (process, mut io) = spawn_sh(TerminalSize::default());

        process.resize(TerminalSize::new(120, 40)).unwrap();
        assert_eq!(process.size(), TerminalSize::new(120, 40));

        io.input.send(b"stty size\n".to_vec()).await.unwrap();
        assert!(wait_for_output(&mut io, "40 120").await);

        process.kill();
    }

    #[tokio::test]
    async fn test_resize_rejects_zero() {
        let (process, _io) = spawn_sh(TerminalSize::default());

        let result = process.resize(TerminalSize::new(0, 10));
        assert!(matches!(
            result,
            Err(SessionError::InvalidSize { cols: 0, rows: 10 })
        ));
        assert_eq!(process.size(), TerminalSize::new(80, 24));

        process.kill();
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (process, io) = spawn_sh(TerminalSize::default());

        assert!(process.kill());
        assert!(!process.kill());
        assert_eq!(process.state(), SessionState::Closed);

        let code = timeout(Duration::from_secs(5), io.exit).await.unwrap().unwrap();
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn test_concurrent_kills_signal_once() {
        let (process, io) = spawn_sh(TerminalSize::default());

        let killers: Vec<_> = (0..8)
            .map(|_| {
                let process = Arc::clone(&process);
                thread::spawn(move || process.kill())
            })
            .collect();
        let signalled = killers
            .into_iter()
            .map(|handle| handle.join())
            .filter(|joined| matches!(joined, Ok(true)))
            .count();
        assert_eq!(signalled, 1);

        timeout(Duration::from_secs(5), io.exit).await.unwrap().unwrap();
        assert_eq!(process.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_input_queue_fills_without_blocking() {
        let (process, mut io) = spawn_sh(TerminalSize::default());

        // The shell stops reading, so the tty and then the queue fill up
        io.input
            .send(b"stty -echo; sleep 5\n".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let line = format!("# {}\n", "x".repeat(1021)).into_bytes();
        let mut full = false;
        for _ in 0..2000 {
            match io.input.try_send(line.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    full = true;
                    break;
                }
                Err(e) => panic!("Input queue closed: {}", e),
            }
        }
        assert!(full, "Input queue never reported Full");
        assert!(process.is_active());

        process.kill();
    }

    #[tokio::test]
    async fn test_resize_after_kill() {
        let (process, _io) = spawn_sh(TerminalSize::default());
        process.kill();

        let result = process.resize(TerminalSize::new(100, 50));
        assert!(matches!(result, Err(SessionError::AlreadyTerminated(_))));
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let (process, mut io) = spawn_sh(TerminalSize::default());

        io.input.send(b"exit 42\n".to_vec()).await.unwrap();

        let code = timeout(Duration::from_secs(5), &mut io.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 42);
        assert_eq!(process.state(), SessionState::Closed);

        // Natural exit leaves nothing to kill
        assert!(!process.kill());
    }

    #[tokio::test]
    async fn test_output_closes_after_exit() {
        let (_process, mut io) = spawn_sh(TerminalSize::default());

        io.input.send(b"exit 0\n".to_vec()).await.unwrap();

        let mut closed = false;
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), io.output.recv()).await {
                Ok(None) => {
                    closed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(closed, "Output channel did not close after exit");
    }

    #[tokio::test]
    async fn test_summary() {
        let mut request = PendingRequest::new("tok".to_string(), TerminalSize::new(90, 20));
        request.username = Some("alice".to_string());
        let (process, _io) = PtyProcess::spawn(request, &sh(), "xterm-color").unwrap();

        let summary = process.summary();
        assert_eq!(summary.pid, process.pid());
        assert_eq!(summary.size, TerminalSize::new(90, 20));
        assert_eq!(summary.username.as_deref(), Some("alice"));

        process.kill();
    }
}
