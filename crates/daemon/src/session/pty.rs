//! Shell process management.
//!
//! A [`ProcessHandle`] owns one shell spawned on a pseudo-terminal. Three
//! threads serve it: a reader delivering output as [`ProcessEvent`]s, a
//! writer draining queued input, and a waiter that reaps the shell. Events
//! are one `Output` per OS read, followed by exactly one `Exit`.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver as DrainReceiver, RecvTimeoutError, Sender as DrainSender};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{ExitInfo, TerminalSize, TERM_NAME};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Transport-assigned identity of a client connection.
pub type ConnectionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to allocate the PTY or start the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to signal the shell process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// A session is already registered for this connection.
    #[error("connection already has a session: {0}")]
    DuplicateConnection(ConnectionId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events produced by a running shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of output, exactly as one read returned it.
    Output(Vec<u8>),
    /// The process ended. Always the last event.
    Exit(ExitInfo),
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for process events.
const EVENT_CAPACITY: usize = 256;

/// How long output is still forwarded after the shell has been reaped.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Exit code base for a signal-terminated shell, as `$?` reports it.
#[cfg(unix)]
const SIGNAL_EXIT_BASE: i32 = 128;

/// Event sender shared by the reader and waiter threads. The waiter takes it
/// when it reports the exit, which closes the stream to further output.
type SharedEvents = Arc<StdMutex<Option<mpsc::Sender<ProcessEvent>>>>;

/// What to run and how to size it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Shell program.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Initial geometry.
    pub size: TerminalSize,
    /// Working directory. `None` means the server's current directory at spawn time.
    pub cwd: Option<PathBuf>,
    /// Value exported as `TERM`.
    pub term: String,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            program: default_shell().to_string(),
            args: Vec::new(),
            size: TerminalSize::default(),
            cwd: None,
            term: TERM_NAME.to_string(),
        }
    }
}

/// Returns the shell for the current platform.
pub fn default_shell() -> &'static str {
    if cfg!(windows) {
        "powershell.exe"
    } else {
        "bash"
    }
}

/// A shell process attached to a pseudo-terminal.
///
/// Once the process has exited or been killed, `write` and `resize` become
/// silent no-ops and `kill` returns immediately.
pub struct ProcessHandle {
    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Input queue drained by the writer thread.
    input: mpsc::UnboundedSender<Vec<u8>>,

    /// Signals the child without owning it; the waiter thread owns and reaps it.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Cleared on exit or kill.
    running: Arc<AtomicBool>,

    /// Process ID.
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Spawns a shell on a new PTY.
    ///
    /// The child inherits the server's full environment plus `TERM`.
    ///
    /// # Returns
    /// The handle and a receiver for its output and exit events.
    pub fn spawn(
        options: &SpawnOptions,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(options.size))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let cwd = match &options.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let mut cmd = CommandBuilder::new(&options.program);
        cmd.args(&options.args);
        cmd.cwd(cwd);
        cmd.env("TERM", &options.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", options.program, e)))?;

        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let events: SharedEvents = Arc::new(StdMutex::new(Some(events_tx)));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let started = start_threads(
            pid.unwrap_or(0),
            &*pair.master,
            child,
            events,
            input_rx,
            Arc::clone(&running),
        );
        if let Err(e) = started {
            running.store(false, Ordering::SeqCst);
            let _ = killer.kill();
            return Err(e);
        }

        let handle = ProcessHandle {
            master: Mutex::new(pair.master),
            input: input_tx,
            killer: Mutex::new(killer),
            running,
            pid,
        };

        tracing::debug!(
            pid = ?pid,
            program = %options.program,
            cols = options.size.cols,
            rows = options.size.rows,
            "Spawned shell"
        );

        Ok((handle, events_rx))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues raw bytes for the shell's standard input.
    ///
    /// Returns as soon as the bytes are queued; the writer thread delivers
    /// them in order, however long the shell takes to read them.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), SessionError> {
        let data = data.into();
        if !self.is_running() {
            tracing::trace!(pid = ?self.pid, len = data.len(), "Dropping write to exited process");
            return Ok(());
        }

        self.input
            .send(data)
            .map_err(|_| SessionError::WriteFailed("input writer has stopped".to_string()))
    }

    /// Resizes the PTY. Values are applied as given.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        if !self.is_running() {
            tracing::trace!(pid = ?self.pid, "Dropping resize of exited process");
            return Ok(());
        }

        let master = self.master.lock().await;
        master
            .resize(pty_size(size))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        tracing::debug!(pid = ?self.pid, cols = size.cols, rows = size.rows, "Resized PTY");

        Ok(())
    }

    /// Queries the PTY for its current geometry.
    pub async fn size(&self) -> Result<TerminalSize, SessionError> {
        let master = self.master.lock().await;
        let size = master
            .get_size()
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
        Ok(TerminalSize::new(size.cols, size.rows))
    }

    /// Terminates the process.
    ///
    /// Idempotent: once the process has exited or been killed, this is a
    /// no-op. The exit is reaped by the waiter thread.
    pub async fn kill(&self) -> Result<(), SessionError> {
        let mut killer = self.killer.lock().await;

        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        match killer.kill() {
            Ok(()) => {
                tracing::debug!(pid = ?self.pid, "Sent termination signal");
                Ok(())
            }
            Err(e) if is_already_gone(&e) => {
                tracing::debug!(pid = ?self.pid, "Process already gone");
                Ok(())
            }
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.killer.get_mut().kill();
        }
    }
}

/// Starts the waiter, reader and writer threads for a freshly spawned shell.
fn start_threads(
    label: u32,
    master: &dyn MasterPty,
    child: Box<dyn Child + Send + Sync>,
    events: SharedEvents,
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    running: Arc<AtomicBool>,
) -> Result<(), SessionError> {
    let (drained_tx, drained_rx) = std::sync::mpsc::channel();

    let waiter_events = Arc::clone(&events);
    std::thread::Builder::new()
        .name(format!("pty-waiter-{label}"))
        .spawn(move || report_exit(child, waiter_events, drained_rx, running))?;

    let reader = master
        .try_clone_reader()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    let writer = master
        .take_writer()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    std::thread::Builder::new()
        .name(format!("pty-reader-{label}"))
        .spawn(move || pump_output(reader, events, drained_tx))?;
    std::thread::Builder::new()
        .name(format!("pty-writer-{label}"))
        .spawn(move || pump_input(writer, input))?;

    Ok(())
}

/// Forwards PTY output until EOF, the receiver goes away, or the exit has
/// been reported. Dropping `_drained` tells the waiter the stream is done.
fn pump_output(
    mut reader: Box<dyn Read + Send>,
    events: SharedEvents,
    _drained: DrainSender<()>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let guard = events.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(sender) = guard.as_ref() else {
                    tracing::trace!(len = n, "Discarding PTY output after exit");
                    break;
                };
                if sender
                    .blocking_send(ProcessEvent::Output(buffer[..n].to_vec()))
                    .is_err()
                {
                    tracing::trace!("No receiver for PTY output");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the slave side closes.
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Writes queued input until the queue closes or the PTY refuses it.
fn pump_input(mut writer: Box<dyn Write + Send>, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(error = %e, "PTY write failed; discarding further input");
            break;
        }
    }
}

/// Reaps the shell, lets the reader catch up, then sends the single `Exit`.
fn report_exit(
    child: Box<dyn Child + Send + Sync>,
    events: SharedEvents,
    drained: DrainReceiver<()>,
    running: Arc<AtomicBool>,
) {
    let exit = reap(child);
    running.store(false, Ordering::SeqCst);

    if let Err(RecvTimeoutError::Timeout) = drained.recv_timeout(EXIT_DRAIN_GRACE) {
        tracing::debug!("Terminal still held open after shell exit; discarding later output");
    }

    let sender = events.lock().unwrap_or_else(PoisonError::into_inner).take();

    tracing::debug!(exit_code = exit.exit_code, signal = ?exit.signal, "Shell exited");
    if let Some(sender) = sender {
        let _ = sender.blocking_send(ProcessEvent::Exit(exit));
    }
}

/// Blocks until the shell terminates and decodes its wait status.
#[cfg(unix)]
fn reap(child: Box<dyn Child + Send + Sync>) -> ExitInfo {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    let Some(pid) = child.process_id().and_then(|pid| i32::try_from(pid).ok()) else {
        return wait_child(child);
    };
    let pid = Pid::from_raw(pid);

    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitInfo::code(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                let signal = signal as i32;
                return ExitInfo {
                    exit_code: SIGNAL_EXIT_BASE + signal,
                    signal: Some(signal),
                };
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(pid = %pid, error = %e, "Failed to reap shell process");
                return ExitInfo::code(-1);
            }
        }
    }
}

#[cfg(not(unix))]
fn reap(child: Box<dyn Child + Send + Sync>) -> ExitInfo {
    wait_child(child)
}

/// Waits through the PTY layer, which reports no terminating signal.
fn wait_child(mut child: Box<dyn Child + Send + Sync>) -> ExitInfo {
    match child.wait() {
        Ok(status) => ExitInfo::code(i32::try_from(status.exit_code()).unwrap_or(i32::MAX)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reap shell process");
            ExitInfo::code(-1)
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(unix)]
fn is_already_gone(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32)
}

#[cfg(not(unix))]
fn is_already_gone(_err: &std::io::Error) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::time::{Duration, Instant};
    use tokio::time::timeout;

    fn sh() -> SpawnOptions {
        SpawnOptions {
            program: "/bin/sh".to_string(),
            ..SpawnOptions::default()
        }
    }

    /// Collects output until `marker` shows up or the events run dry.
    async fn read_until(rx: &mut mpsc::Receiver<ProcessEvent>, marker: &str) -> String {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(ProcessEvent::Output(data))) => {
                    collected.push_str(&String::from_utf8_lossy(&data));
                    if collected.contains(marker) {
                        break;
                    }
                }
                Ok(Some(ProcessEvent::Exit(_))) | Ok(None) => break,
                Err(_) => {}
            }
        }
        collected
    }

    async fn wait_for_exit(rx: &mut mpsc::Receiver<ProcessEvent>) -> Option<ExitInfo> {
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(ProcessEvent::Exit(info))) => return Some(info),
                Ok(Some(ProcessEvent::Output(_))) | Err(_) => {}
                Ok(None) => return None,
            }
        }
        None
    }

    #[test]
    fn test_default_shell_is_platform_fixed() {
        if cfg!(windows) {
            assert_eq!(default_shell(), "powershell.exe");
        } else {
            assert_eq!(default_shell(), "bash");
        }
    }

    #[test]
    fn test_default_spawn_options() {
        let options = SpawnOptions::default();
        assert!(options.args.is_empty());
        assert_eq!(options.size, TerminalSize::new(80, 30));
        assert_eq!(options.term, "xterm-color");
        assert!(options.cwd.is_none());
    }

    #[tokio::test]
    async fn test_spawn_reports_pid_and_size() {
        let (handle, _rx) = ProcessHandle::spawn(&sh()).unwrap();

        assert!(handle.is_running());
        assert!(handle.pid().unwrap_or(0) > 0);
        assert_eq!(handle.size().await.unwrap(), TerminalSize::new(80, 30));

        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let options = SpawnOptions {
            program: "/nonexistent/shell-that-does-not-exist".to_string(),
            ..SpawnOptions::default()
        };
        let result = ProcessHandle::spawn(&options);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_write_reaches_shell() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.write(b"echo pty_write_marker\n").unwrap();
        let output = read_until(&mut rx, "pty_write_marker\r\n").await;
        assert!(output.contains("pty_write_marker"), "got: {output:?}");

        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_environment_is_inherited() {
        std::env::set_var("PTYBRIDGE_PTY_TEST_VAR", "inherited_value");
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.write(b"echo $PTYBRIDGE_PTY_TEST_VAR\n").unwrap();
        let output = read_until(&mut rx, "inherited_value\r\n").await;
        assert!(output.contains("inherited_value"), "got: {output:?}");

        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_term_is_exported() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.write(b"echo term=$TERM\n").unwrap();
        let output = read_until(&mut rx, "term=xterm-color").await;
        assert!(output.contains("term=xterm-color"), "got: {output:?}");

        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_cwd_is_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = SpawnOptions {
            cwd: Some(dir.path().to_path_buf()),
            ..sh()
        };
        let (handle, mut rx) = ProcessHandle::spawn(&options).unwrap();

        handle.write(b"pwd\n").unwrap();
        let name = dir
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        let output = read_until(&mut rx, &name).await;
        assert!(output.contains(&name), "got: {output:?}");

        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_changes_geometry() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.resize(TerminalSize::new(120, 40)).await.unwrap();
        assert_eq!(handle.size().await.unwrap(), TerminalSize::new(120, 40));

        handle.write(b"stty size\n").unwrap();
        let output = read_until(&mut rx, "40 120").await;
        assert!(output.contains("40 120"), "got: {output:?}");

        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_natural_exit_reports_code() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.write(b"exit 42\n").unwrap();
        let exit = wait_for_exit(&mut rx).await.expect("no exit event");
        assert_eq!(exit.exit_code, 42);
        assert_eq!(exit.signal, None);
        assert!(!handle.is_running());

        // Nothing follows the exit event.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_kill_ends_process_and_emits_exit() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.kill().await.unwrap();
        assert!(!handle.is_running());

        let exit = wait_for_exit(&mut rx).await.expect("no exit event");
        assert_eq!(exit.signal, Some(Signal::SIGHUP as i32));
        assert_eq!(exit.exit_code, 128 + Signal::SIGHUP as i32);
    }

    #[tokio::test]
    async fn test_sigkill_reports_signal_number() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        let pid = Pid::from_raw(handle.pid().unwrap() as i32);
        signal::kill(pid, Signal::SIGKILL).unwrap();

        let exit = wait_for_exit(&mut rx).await.expect("no exit event");
        assert_eq!(
            exit,
            ExitInfo {
                exit_code: 137,
                signal: Some(9),
            }
        );
        assert!(!handle.is_running());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_exit_not_delayed_by_background_job() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        // The background sleep keeps the terminal open after the shell exits.
        handle.write(b"sleep 5 & exit 0\n").unwrap();

        let started = Instant::now();
        let exit = wait_for_exit(&mut rx).await.expect("no exit event");
        assert_eq!(exit, ExitInfo::code(0));
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "exit took {:?}",
            started.elapsed()
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_returns_while_shell_is_busy() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.write(b"sleep 5\n").unwrap();

        // Far more than the PTY input buffer holds while nothing reads it.
        let paste = vec![b'x'; 256 * 1024];
        let started = Instant::now();
        for _ in 0..4 {
            handle.write(paste.as_slice()).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        timeout(Duration::from_secs(2), handle.kill())
            .await
            .expect("kill waited on pending input")
            .unwrap();

        let exit = wait_for_exit(&mut rx).await.expect("no exit event");
        assert!(exit.signal.is_some());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (handle, _rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.kill().await.unwrap();
        handle.kill().await.unwrap();
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_after_natural_exit_is_ok() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.write(b"exit 0\n").unwrap();
        wait_for_exit(&mut rx).await.expect("no exit event");

        assert!(handle.kill().await.is_ok());
    }

    #[tokio::test]
    async fn test_write_and_resize_after_kill_are_noops() {
        let (handle, _rx) = ProcessHandle::spawn(&sh()).unwrap();

        handle.kill().await.unwrap();

        assert!(handle.write(b"hello\n").is_ok());
        assert!(handle.resize(TerminalSize::new(100, 50)).await.is_ok());
        assert_eq!(handle.size().await.unwrap(), TerminalSize::new(80, 30));
    }
}
