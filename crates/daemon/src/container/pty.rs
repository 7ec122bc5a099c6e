//! Pseudo-terminal backed stream.
//!
//! The container runtime is driven through its CLI client, which is spawned
//! on a PTY. The master side of that PTY is the session's source stream.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{Stream, StreamError, StreamFuture};
use tokio::sync::Mutex;

use super::ContainerError;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// A process running on a pseudo-terminal, exposed as a [`Stream`].
///
/// `produce` reads terminal output, `consume` writes terminal input and
/// `close` kills the process, which ends any pending read.
pub struct PtyStream {
    label: String,
    reader: Arc<StdMutex<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    closed: AtomicBool,
}

impl PtyStream {
    /// Spawns `program` with `args` on a new PTY of the given size.
    ///
    /// `label` identifies the stream in logs.
    pub fn spawn(
        label: &str,
        program: &str,
        args: &[String],
        cols: u16,
        rows: u16,
    ) -> Result<Self, ContainerError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;
        // Only the child may hold the slave, otherwise reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        tracing::debug!(stream = %label, pid = ?pid, program = %program, "Spawned PTY process");

        Ok(Self {
            label: label.to_string(),
            reader: Arc::new(StdMutex::new(reader)),
            writer: Mutex::new(Some(writer)),
            master: StdMutex::new(Some(pair.master)),
            child: StdMutex::new(child),
            pid,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the process ID of the PTY child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true if the child process is still running.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        matches!(child.try_wait(), Ok(None))
    }
}

/// On Linux a PTY master read fails with EIO once the child side is gone.
fn is_hangup(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

impl Stream for PtyStream {
    fn produce(&self) -> StreamFuture<'_, Result<Option<Bytes>, StreamError>> {
        Box::pin(async move {
            if self.is_closed() {
                return Ok(None);
            }

            let reader = Arc::clone(&self.reader);
            let result = tokio::task::spawn_blocking(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                let mut reader = reader.lock().unwrap_or_else(|e| e.into_inner());
                match reader.read(&mut buffer) {
                    Ok(0) => Ok(None),
                    Ok(n) => {
                        buffer.truncate(n);
                        Ok(Some(Bytes::from(buffer)))
                    }
                    Err(e) => Err(e),
                }
            })
            .await;

            match result {
                Ok(Ok(Some(data))) => Ok(Some(data)),
                Ok(Ok(None)) => {
                    tracing::info!(stream = %self.label, "PTY EOF - process exited");
                    Ok(None)
                }
                Ok(Err(e)) if is_hangup(&e) || self.is_closed() => {
                    tracing::info!(stream = %self.label, "PTY hung up - process exited");
                    Ok(None)
                }
                Ok(Err(e)) => {
                    tracing::error!(stream = %self.label, error = %e, "Error reading from PTY");
                    Err(StreamError::Io(e.to_string()))
                }
                Err(e) => {
                    tracing::error!(stream = %self.label, error = %e, "Read task panicked");
                    Err(StreamError::Io(e.to_string()))
                }
            }
        })
    }

    fn consume<'a>(&'a self, chunk: &'a [u8]) -> StreamFuture<'a, Result<(), StreamError>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(StreamError::Closed);
            }

            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(StreamError::Closed)?;
            writer.write_all(chunk)?;
            writer.flush()?;
            Ok(())
        })
    }

    fn close(&self) -> StreamFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            let kill_result = {
                let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
                match child.try_wait() {
                    Ok(Some(_)) => Ok(()),
                    _ => child.kill(),
                }
            };

            self.writer.lock().await.take();
            self.master
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();

            tracing::debug!(stream = %self.label, "Closed PTY stream");

            kill_result.map_err(|e| StreamError::Io(e.to_string()))
        })
    }
}
