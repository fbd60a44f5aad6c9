//! Local pseudo-terminal running the tunnel process
//!
//! The remote shell is reached by running a tunnel client (e.g. `gcloud compute
//! ssh`) inside a local PTY. Terminal geometry changes on the local PTY are
//! forwarded by ssh to the remote PTY, where tmux re-fits attached clients.
//!
//! A dedicated OS thread performs the blocking reads and turns them into
//! [`TransportEvent`]s; `Closed` is always the last event sent.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{EventStream, ShellSession, TransportError, TransportEvent};

const READ_BUFFER_SIZE: usize = 8192;

/// EIO is what Linux returns from the master side once the child has exited
const EIO: i32 = 5;

/// Handle to a tunnel process running inside a local PTY
pub struct PtySession {
    label: String,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    closed: Arc<AtomicBool>,
}

impl PtySession {
    /// Spawn `program args..` in a fresh PTY of the given size
    pub fn spawn(
        label: impl Into<String>,
        program: &str,
        args: &[String],
        cols: u16,
        rows: u16,
    ) -> Result<(Arc<Self>, EventStream), TransportError> {
        let label = label.into();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| TransportError::Pty(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TransportError::Pty(format!("failed to spawn {program}: {e}")))?;
        // The slave end must not outlive the spawn or reads never see EOF
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TransportError::Pty(format!("failed to open pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TransportError::Pty(format!("failed to open pty writer: {e}")))?;
        let killer = child.clone_killer();

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let thread_label = label.clone();
        let thread_closed = closed.clone();
        std::thread::Builder::new()
            .name(format!("pty-{}", thread_label))
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            if e.raw_os_error() != Some(EIO) && !thread_closed.load(Ordering::SeqCst) {
                                let _ = tx.send(TransportEvent::Error(e.to_string()));
                            }
                            break;
                        }
                    }
                }

                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(e) => {
                        debug!(session = %thread_label, error = %e, "Failed to reap tunnel process");
                        None
                    }
                };
                let _ = tx.send(TransportEvent::Closed(code));
            })
            .map_err(|e| TransportError::Spawn {
                program: "pty reader thread".to_string(),
                source: e,
            })?;

        let session = Arc::new(Self {
            label,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            killer: Mutex::new(killer),
            closed,
        });

        Ok((session, rx))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellSession for PtySession {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), TransportError> {
        let guard = self.master.lock().await;
        let master = guard.as_ref().ok_or(TransportError::Closed)?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| TransportError::Pty(format!("failed to resize pty: {e}")))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.killer.lock().await.kill() {
            // Already exited
            debug!(session = %self.label, error = %e, "Kill on close failed");
        }
        self.writer.lock().await.take();
        if self.master.lock().await.take().is_none() {
            warn!(session = %self.label, "PTY master already released");
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(2),
        cols: cols.max(2),
        pixel_width: 0,
        pixel_height: 0,
    }
}
