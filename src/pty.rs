use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Writes queued ahead of the shell before [`PtyPort::write`] refuses more.
const INPUT_QUEUE_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to write to pty: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[source] std::io::Error),

    #[error("pty reader already started")]
    ReaderTaken,

    #[error("pty input queue is full")]
    InputQueueFull,

    #[error("pty requires a tokio runtime")]
    NoRuntime,

    #[error("pty is closed")]
    Closed,
}

/// The operations the job scheduler needs from a terminal.
///
/// Implemented by [`PtyHandle`]; tests substitute an in-memory fake.
pub trait PtyPort: Send + Sync {
    /// Queue bytes for the terminal input without waiting for the shell to
    /// read them. Each call is written contiguously and calls are written in
    /// the order they were made.
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;

    /// Stop the shell process and release the terminal.
    fn terminate(&self) -> Result<(), PtyError>;

    /// PID of the shell, if known.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Receives everything the shell writes to the terminal.
///
/// Called from the dedicated reader thread, in arrival order.
pub trait PtyOutput: Send + Sync + 'static {
    fn on_output(&self, data: Bytes);

    /// The terminal reached EOF (`None`) or a read failed (`Some`).
    fn on_closed(&self, error: Option<std::io::Error>);
}

/// One interactive shell bound to a pseudo-terminal.
///
/// Input goes through a bounded queue drained by a blocking writer task, so
/// a shell that stops reading never stalls the caller.
pub struct PtyHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    input: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    kill_grace: Duration,
    terminated: AtomicBool,
    terminate_calls: Arc<AtomicUsize>,
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid)
            .field("terminated", &self.terminated.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PtyHandle {
    /// Spawn `shell` as an interactive process on a fresh pty pair.
    ///
    /// Must be called from within a tokio runtime; the input writer runs on
    /// its blocking pool.
    pub fn spawn(shell: &str, rows: u16, cols: u16, kill_grace: Duration) -> Result<Self, PtyError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PtyError::NoRuntime)?;
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()));
        if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(home);
        }

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        // Our copy of the slave must go, otherwise the reader never sees EOF
        // when the shell exits.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;
        let pid = child.process_id();

        tracing::debug!(?pid, shell, "spawned shell on pty");

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_QUEUE_CAPACITY);
        runtime.spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                drain_input(writer, input_rx, pid);
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            input: Mutex::new(Some(input_tx)),
            reader: Mutex::new(Some(reader)),
            child: Mutex::new(child),
            pid,
            kill_grace,
            terminated: AtomicBool::new(false),
            terminate_calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Start the background reader that drains terminal output into `sink`.
    ///
    /// Can only be called once.
    pub fn start_reader(&self, sink: Arc<dyn PtyOutput>) -> Result<(), PtyError> {
        let mut reader = self.reader.lock().take().ok_or(PtyError::ReaderTaken)?;
        let pid = self.pid;

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            sink.on_closed(None);
                            break;
                        }
                        Ok(n) => sink.on_output(Bytes::copy_from_slice(&buf[..n])),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        // Linux reports a hung-up pty master as EIO.
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                            sink.on_closed(None);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(?pid, error = %e, "pty read failed");
                            sink.on_closed(Some(e));
                            break;
                        }
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader task panicked: {:?}", e);
            }
        });
        Ok(())
    }

    /// Number of times [`PtyPort::terminate`] has been invoked on this handle.
    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Whether the shell process has exited.
    pub fn has_exited(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(Some(_)))
    }

    /// Signal the shell's process group.
    ///
    /// portable_pty calls setsid() when spawning, so the shell leads its own
    /// group and background jobs started from it share that group.
    fn signal_group(&self, signal: libc::c_int) {
        if let Some(pid) = self.pid {
            if pid == 0 || pid > i32::MAX as u32 {
                tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
                return;
            }
            #[cfg(unix)]
            unsafe {
                libc::kill(-(pid as i32), signal);
            }
        }
    }

    fn wait_exit(&self, deadline: Instant) -> Result<bool, PtyError> {
        loop {
            if self.child.lock().try_wait().map_err(PtyError::Wait)?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Copy queued input to the pty until the queue closes or a write fails.
///
/// Blocks while the shell is not reading. Once the shell is killed its slave
/// side is gone and the pending write fails, which ends the loop.
fn drain_input(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>, pid: Option<u32>) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(?pid, error = %PtyError::Write(e), "pty writer stopped");
            break;
        }
    }
}

impl PtyPort for PtyHandle {
    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let guard = self.input.lock();
        let input = guard.as_ref().ok_or(PtyError::Closed)?;
        input
            .try_send(Bytes::copy_from_slice(data))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PtyError::InputQueueFull,
                mpsc::error::TrySendError::Closed(_) => PtyError::Closed,
            })
    }

    /// SIGHUP the shell's process group, escalate to SIGKILL after the grace
    /// period, then close the pty. Blocks for at most the grace period plus
    /// the final reap.
    fn terminate(&self) -> Result<(), PtyError> {
        self.terminate_calls.fetch_add(1, Ordering::AcqRel);
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let already_exited = self.child.lock().try_wait().map_err(PtyError::Wait)?.is_some();
        if !already_exited {
            self.signal_group(libc::SIGHUP);
            if !self.wait_exit(Instant::now() + self.kill_grace)? {
                tracing::debug!(pid = ?self.pid, "shell ignored SIGHUP, sending SIGKILL");
                self.signal_group(libc::SIGKILL);
                let mut child = self.child.lock();
                let _ = child.kill();
                child.wait().map_err(PtyError::Wait)?;
            }
        }

        self.input.lock().take();
        self.master.lock().take();
        tracing::debug!(pid = ?self.pid, "pty terminated");
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::Acquire) {
            self.signal_group(libc::SIGHUP);
        }
    }
}
