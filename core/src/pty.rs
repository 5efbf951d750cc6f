//! PTY Handle: spawn a shell in a pseudo-terminal and bridge its master fd to
//! async callers. Reading happens on a dedicated OS thread (portable-pty's reader is
//! blocking); resize and writes are dispatched through a writer thread / resize thread
//! so the async side never blocks on PTY I/O directly.

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Internal PTY-layer error, distinct from the client-facing `BrokerError`: a Terminal
/// Session translates these into the wire vocabulary, adding request context.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn pty: {0}")]
    SpawnFailed(String),
    #[error("pty handle is not open")]
    NotOpen,
    #[error("pty write timed out")]
    WriteTimeout,
    #[error("io error: {0}")]
    Io(String),
}

/// One chunk of the PTY reader loop's output, or a terminal event (EOF / read error).
/// Kept as three variants (rather than collapsing EOF into channel closure) so the
/// Terminal Session's state machine can distinguish ClosedGraceful from ClosedError.
#[derive(Debug)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Eof,
    ReadError(String),
}

fn shell_command() -> CommandBuilder {
    #[cfg(unix)]
    {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let mut c = CommandBuilder::new(shell);
        c.env("TERM", "xterm-256color");
        c.env("COLORTERM", "truecolor");
        c
    }
    #[cfg(windows)]
    {
        let mut c = CommandBuilder::new("cmd.exe");
        c.env("TERM", "xterm-256color");
        c.env("COLORTERM", "truecolor");
        c
    }
}

fn command_for(cwd: Option<&Path>) -> CommandBuilder {
    let mut cmd = shell_command();
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    cmd
}

/// Sender used to request a PTY resize (cols, rows). A dedicated thread applies the
/// ioctl; repeated identical requests are coalesced into a single ioctl call.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Bridge to a spawned PTY child: writer handle, resize channel, and kill/close control.
pub struct PtyHandle {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    resize_tx: ResizeSender,
    closed: Arc<AtomicBool>,
}

/// Spawn a shell in a PTY of the given size, optionally in `cwd`. Returns the handle
/// plus a receiver of `PtyEvent`s from the reader loop.
pub fn spawn_pty(
    cwd: Option<PathBuf>,
    cols: u16,
    rows: u16,
) -> Result<(PtyHandle, mpsc::Receiver<PtyEvent>), PtyError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

    let cmd = command_for(cwd.as_deref());
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<PtyEvent>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();

    // Reader thread: portable-pty's Read impl is blocking, so this can't live on the
    // async runtime. Ok(0) is a real EOF exactly once; the thread exits right after.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(PtyEvent::Eof);
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(PtyEvent::ReadError(e.to_string()));
                    break;
                }
            }
        }
    });

    // Resize thread: coalesces to a single ioctl when the requested size is unchanged
    // from the last one applied, satisfying the "idempotent when dimensions unchanged"
    // contract without any locking on the hot path.
    std::thread::spawn(move || {
        let mut last: Option<(u16, u16)> = None;
        while let Ok((cols, rows)) = resize_rx.recv() {
            if last == Some((cols, rows)) {
                continue;
            }
            let size = PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            };
            if master.resize(size).is_ok() {
                last = Some((cols, rows));
            }
        }
    });

    let handle = PtyHandle {
        writer: Arc::new(Mutex::new(writer)),
        child: Arc::new(Mutex::new(child)),
        resize_tx,
        closed: Arc::new(AtomicBool::new(false)),
    };
    Ok((handle, rx))
}

impl PtyHandle {
    /// Write keystrokes to the PTY master. Fails with `WriteTimeout` if the blocking
    /// write doesn't complete within `timeout`; fails with `NotOpen` if already closed.
    pub async fn write(&self, data: Vec<u8>, timeout: Duration) -> Result<usize, PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::NotOpen);
        }
        let writer = Arc::clone(&self.writer);
        let len = data.len();
        let task = tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let mut guard = writer.lock().expect("pty writer mutex");
            guard.write_all(&data)?;
            guard.flush()
        });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(len),
            Ok(Ok(Err(e))) => Err(PtyError::Io(e.to_string())),
            Ok(Err(e)) => Err(PtyError::Io(e.to_string())),
            Err(_) => Err(PtyError::WriteTimeout),
        }
    }

    /// Request a resize. No-op success if the handle is already closed.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.resize_tx.send((cols, rows));
        Ok(())
    }

    /// Close the PTY: SIGHUP, wait a grace period, then SIGKILL; reap the child.
    pub async fn close(&self, grace_period: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.child_pid() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGHUP);
            }
        }
        tokio::time::sleep(grace_period).await;
        let child = Arc::clone(&self.child);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = child.lock() {
                let _ = guard.kill();
                let _ = guard.wait();
            }
        })
        .await;
    }

    #[cfg(unix)]
    fn child_pid(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|g| g.process_id())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_write_and_read_echo() {
        let Ok((handle, mut rx)) = spawn_pty(None, 80, 24) else {
            // No PTY support in this environment (e.g. restricted CI sandbox).
            return;
        };
        handle
            .write(b"echo hello-pty\n".to_vec(), Duration::from_secs(2))
            .await
            .expect("write should succeed");

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(PtyEvent::Data(d))) => {
                    collected.extend_from_slice(&d);
                    if String::from_utf8_lossy(&collected).contains("hello-pty") {
                        break;
                    }
                }
                Ok(Some(_)) => break,
                _ => continue,
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hello-pty"));
        handle.close(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn resize_is_idempotent_and_closed_handle_noops() {
        let Ok((handle, _rx)) = spawn_pty(None, 80, 24) else {
            return;
        };
        assert!(handle.resize(100, 40).is_ok());
        assert!(handle.resize(100, 40).is_ok());
        handle.close(Duration::from_millis(10)).await;
        assert!(handle.is_closed());
        assert!(handle.resize(100, 40).is_ok());
    }

    #[tokio::test]
    async fn write_after_close_fails_not_open() {
        let Ok((handle, _rx)) = spawn_pty(None, 80, 24) else {
            return;
        };
        handle.close(Duration::from_millis(10)).await;
        let result = handle.write(b"x".to_vec(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PtyError::NotOpen)));
    }
}
