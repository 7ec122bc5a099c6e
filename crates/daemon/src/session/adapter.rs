//! Session adapter.
//!
//! A [`SessionAdapter`] couples one source stream (the container terminal)
//! with a dynamic set of viewer streams. Output flows through a
//! [`BroadcastMux`]; input flows through one pump task per viewer, with
//! writes to the source serialized so chunks from different viewers never
//! interleave mid-chunk.
//!
//! The adapter moves through `Pending -> Running -> Closed` exactly once.
//! [`SessionAdapter::connect`] drives the whole running phase and performs
//! teardown itself, so the disconnect hook runs exactly once no matter how
//! many viewers detach concurrently.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::{Stream, StreamError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::multiplexer::{
    run_writer, BroadcastMux, MuxOutcome, ViewerId, ViewerSet, WriterOutcome,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::container::ContainerError;

/// Unique identifier for a session. Equal to the backing container's ID.
pub type SessionId = String;

/// Callback run once when a session terminates.
pub type DisconnectHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Default number of viewers per session.
pub const DEFAULT_MAX_VIEWERS: usize = 16;

/// Default time a session survives with no viewers attached.
pub const DEFAULT_HEADLESS_GRACE: Duration = Duration::from_secs(300);

/// How long attaching waits for a viewer to accept the session announcement.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long teardown waits for viewer queues to flush.
const TEARDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur in session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Building the container image failed.
    #[error("build failed: {0}")]
    Build(#[source] ContainerError),

    /// Starting the container failed.
    #[error("start failed: {0}")]
    Start(#[source] ContainerError),

    /// The request or call sequence is not valid.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// The session has already terminated.
    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    /// A session with this ID is already registered.
    #[error("duplicate session: {0}")]
    DuplicateSession(SessionId),

    /// A stream operation failed.
    #[error("stream failed: {0}")]
    StreamFailed(#[from] StreamError),

    /// The disconnect hook failed during teardown.
    #[error("disconnect failed for session {session_id}: {message}")]
    DisconnectFailed {
        session_id: SessionId,
        message: String,
    },

    /// The daemon is already running its maximum number of sessions.
    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    /// The session already has its maximum number of viewers.
    #[error("viewer limit reached ({0})")]
    ViewerLimit(usize),
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, not yet connected.
    Pending,
    /// Connected and moving bytes.
    Running,
    /// Terminated. Attaching fails.
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Pending => "pending",
            SessionPhase::Running => "running",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session terminated.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    /// The source reached end of stream.
    SourceEnded,
    /// Reading the source failed.
    SourceFailed(StreamError),
    /// Writing viewer input to the source failed.
    SourceWriteFailed(StreamError),
    /// No viewer was attached for the whole grace period.
    ViewersGone,
    /// [`SessionAdapter::shutdown`] was called.
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::SourceEnded => write!(f, "source ended"),
            TerminationReason::SourceFailed(e) => write!(f, "source failed: {e}"),
            TerminationReason::SourceWriteFailed(e) => write!(f, "source write failed: {e}"),
            TerminationReason::ViewersGone => write!(f, "all viewers gone"),
            TerminationReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub reason: TerminationReason,
    /// Number of source chunks broadcast over the session's life.
    pub chunks_broadcast: u64,
}

/// How a viewer input pump ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpOutcome {
    /// The viewer reached end of stream.
    ViewerEnded,
    /// Reading the viewer failed.
    ViewerFailed(StreamError),
    /// Writing to the source failed.
    SourceWriteFailed(StreamError),
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub phase: SessionPhase,
    pub viewers: usize,
    pub chunks_broadcast: u64,
}

/// Per-session limits and tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum number of concurrently attached viewers.
    pub max_viewers: usize,
    /// Capacity of each viewer's outbound queue, in chunks.
    pub queue_capacity: usize,
    /// How long the session keeps running with no viewers. Zero stops it as
    /// soon as the last viewer leaves.
    pub headless_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_viewers: DEFAULT_MAX_VIEWERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            headless_grace: DEFAULT_HEADLESS_GRACE,
        }
    }
}

/// A viewer registered in the set whose tasks have not been started yet.
struct NewViewer {
    id: ViewerId,
    stream: Arc<dyn Stream>,
    rx: mpsc::Receiver<bytes::Bytes>,
}

enum TaskOutcome {
    Mux(MuxOutcome),
    Pump(ViewerId, PumpOutcome),
    Writer(ViewerId, WriterOutcome),
}

struct Lifecycle {
    phase: SessionPhase,
    /// Viewers attached before `connect`.
    pending: Vec<NewViewer>,
    /// Hands viewers attached while running to the connect loop.
    attached: Option<mpsc::UnboundedSender<NewViewer>>,
}

/// Couples a source stream with a dynamic set of viewers.
pub struct SessionAdapter {
    id: SessionId,
    source: Arc<dyn Stream>,
    source_write: Arc<Mutex<()>>,
    viewers: Arc<ViewerSet>,
    options: SessionOptions,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    chunks: Arc<AtomicU64>,
    on_disconnect: StdMutex<Option<DisconnectHook>>,
}

impl SessionAdapter {
    /// Creates a pending session over `source`.
    pub fn new(id: impl Into<SessionId>, source: Arc<dyn Stream>, options: SessionOptions) -> Self {
        Self {
            id: id.into(),
            source,
            source_write: Arc::new(Mutex::new(())),
            viewers: Arc::new(ViewerSet::new(options.queue_capacity)),
            options,
            lifecycle: Mutex::new(Lifecycle {
                phase: SessionPhase::Pending,
                pending: Vec::new(),
                attached: None,
            }),
            shutdown: CancellationToken::new(),
            chunks: Arc::new(AtomicU64::new(0)),
            on_disconnect: StdMutex::new(None),
        }
    }

    /// Installs the callback run once at teardown, after every stream is closed.
    pub fn with_disconnect_hook<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        *self.on_disconnect.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(hook())
            }));
        self
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the current lifecycle phase.
    pub async fn phase(&self) -> SessionPhase {
        self.lifecycle.lock().await.phase
    }

    /// Returns a snapshot of the session's state.
    pub async fn stats(&self) -> SessionStats {
        let phase = self.phase().await;
        SessionStats {
            session_id: self.id.clone(),
            phase,
            viewers: self.viewers.len().await,
            chunks_broadcast: self.chunks.load(Ordering::Relaxed),
        }
    }

    /// Asks a running session to terminate. `connect` returns once teardown is done.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Attaches a viewer.
    ///
    /// Once the session is known to accept the viewer, it is told the session
    /// ID through [`Stream::announce`] with `joined` set, ahead of any output.
    /// The viewer then receives every source chunk produced from now on.
    /// Attaching to a pending session queues the viewer until `connect` runs.
    pub async fn attach_stream(&self, stream: Arc<dyn Stream>) -> Result<ViewerId, SessionError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.phase == SessionPhase::Closed {
            return Err(SessionError::SessionClosed(self.id.clone()));
        }
        if self.viewers.len().await >= self.options.max_viewers {
            return Err(SessionError::ViewerLimit(self.options.max_viewers));
        }

        // Bounded so a viewer that never reads cannot hold the lifecycle lock.
        match tokio::time::timeout(ANNOUNCE_TIMEOUT, stream.announce(&self.id, true)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SessionError::StreamFailed(e)),
            Err(_) => return Err(SessionError::StreamFailed(StreamError::Closed)),
        }

        let (viewer_id, rx) = self.viewers.insert(Arc::clone(&stream)).await;
        let viewer = NewViewer {
            id: viewer_id.clone(),
            stream,
            rx,
        };

        match lifecycle.phase {
            SessionPhase::Pending => lifecycle.pending.push(viewer),
            _ => {
                let delivered = match &lifecycle.attached {
                    Some(tx) => tx.send(viewer).is_ok(),
                    None => false,
                };
                if !delivered {
                    // The connect loop is gone without having closed the session.
                    self.viewers.remove(&viewer_id).await;
                    return Err(SessionError::SessionClosed(self.id.clone()));
                }
            }
        }

        tracing::info!(session_id = %self.id, viewer_id = %viewer_id, "Viewer attached");
        Ok(viewer_id)
    }

    /// Detaches a viewer. Output already queued for it is still delivered.
    ///
    /// Returns false if the viewer was not attached.
    pub async fn detach_stream(&self, viewer_id: &str) -> bool {
        let removed = self.viewers.remove(viewer_id).await.is_some();
        if removed {
            tracing::info!(session_id = %self.id, viewer_id = %viewer_id, "Viewer detached");
        }
        removed
    }

    /// Runs the session until it terminates.
    ///
    /// Starts the broadcast loop and one input pump per viewer, waits for a
    /// termination trigger, then tears everything down and runs the
    /// disconnect hook. Fails with `InvalidSession` if `initial_viewers` is
    /// empty or the session was already connected.
    pub async fn connect(
        &self,
        initial_viewers: Vec<Arc<dyn Stream>>,
    ) -> Result<SessionOutcome, SessionError> {
        if initial_viewers.is_empty() {
            return Err(SessionError::InvalidSession(
                "a session needs at least one viewer".to_string(),
            ));
        }

        let (attach_tx, mut attach_rx) = mpsc::unbounded_channel();
        let startup = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.phase != SessionPhase::Pending {
                return Err(SessionError::InvalidSession(format!(
                    "session {} is already {}",
                    self.id, lifecycle.phase
                )));
            }
            if self.viewers.len().await + initial_viewers.len() > self.options.max_viewers {
                return Err(SessionError::ViewerLimit(self.options.max_viewers));
            }

            let mut startup = std::mem::take(&mut lifecycle.pending);
            for stream in initial_viewers {
                let (id, rx) = self.viewers.insert(Arc::clone(&stream)).await;
                startup.push(NewViewer { id, stream, rx });
            }
            lifecycle.phase = SessionPhase::Running;
            lifecycle.attached = Some(attach_tx);
            startup
        };

        tracing::info!(
            session_id = %self.id,
            viewers = startup.len(),
            "Session connected"
        );

        let mut tasks = JoinSet::new();
        let mux = BroadcastMux::new(Arc::clone(&self.source), Arc::clone(&self.viewers))
            .with_counter(Arc::clone(&self.chunks));
        let mux_task = tasks.spawn(async move { TaskOutcome::Mux(mux.run().await) });
        for viewer in startup {
            self.spawn_viewer(&mut tasks, viewer);
        }

        let mut headless_since: Option<Instant> = None;
        let reason = loop {
            let deadline = headless_since.map(|since| since + self.options.headless_grace);
            let grace_elapsed = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break TerminationReason::Shutdown,

                Some(viewer) = attach_rx.recv() => self.spawn_viewer(&mut tasks, viewer),

                Some(joined) = tasks.join_next_with_id() => match joined {
                    Ok((_, TaskOutcome::Mux(MuxOutcome::SourceEnded))) => {
                        break TerminationReason::SourceEnded;
                    }
                    Ok((_, TaskOutcome::Mux(MuxOutcome::SourceFailed(e)))) => {
                        break TerminationReason::SourceFailed(e);
                    }
                    Ok((_, TaskOutcome::Pump(_, PumpOutcome::SourceWriteFailed(e)))) => {
                        break TerminationReason::SourceWriteFailed(e);
                    }
                    Ok((_, TaskOutcome::Pump(viewer_id, outcome))) => {
                        if let PumpOutcome::ViewerFailed(e) = &outcome {
                            tracing::warn!(
                                session_id = %self.id,
                                viewer_id = %viewer_id,
                                error = %e,
                                "Viewer read failed"
                            );
                        }
                        self.detach_stream(&viewer_id).await;
                    }
                    Ok((_, TaskOutcome::Writer(viewer_id, WriterOutcome::Failed(e)))) => {
                        tracing::warn!(
                            session_id = %self.id,
                            viewer_id = %viewer_id,
                            error = %e,
                            "Viewer write failed, evicting"
                        );
                        self.detach_stream(&viewer_id).await;
                    }
                    Ok((_, TaskOutcome::Writer(_, WriterOutcome::Drained))) => {}
                    Err(e) if e.id() == mux_task.id() => {
                        tracing::error!(session_id = %self.id, error = %e, "Broadcast task failed");
                        break TerminationReason::SourceFailed(StreamError::Io(e.to_string()));
                    }
                    Err(e) => {
                        tracing::error!(session_id = %self.id, error = %e, "Session task failed");
                    }
                },

                _ = grace_elapsed => {
                    if self.close_if_headless().await {
                        break TerminationReason::ViewersGone;
                    }
                }
            }

            if self.viewers.is_empty().await {
                if headless_since.is_none() {
                    if self.options.headless_grace.is_zero() {
                        if self.close_if_headless().await {
                            break TerminationReason::ViewersGone;
                        }
                    } else {
                        tracing::info!(
                            session_id = %self.id,
                            grace_secs = self.options.headless_grace.as_secs(),
                            "All viewers gone, keeping session alive"
                        );
                        headless_since = Some(Instant::now());
                    }
                }
            } else {
                headless_since = None;
            }
        };

        self.teardown(&reason, tasks, mux_task, attach_rx).await;

        let outcome = SessionOutcome {
            session_id: self.id.clone(),
            reason,
            chunks_broadcast: self.chunks.load(Ordering::Relaxed),
        };

        let hook = self
            .on_disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            if let Err(e) = hook().await {
                tracing::error!(session_id = %self.id, error = %e, "Disconnect hook failed");
                return Err(SessionError::DisconnectFailed {
                    session_id: self.id.clone(),
                    message: e.to_string(),
                });
            }
        }

        tracing::info!(
            session_id = %self.id,
            reason = %outcome.reason,
            chunks = outcome.chunks_broadcast,
            "Session terminated"
        );
        Ok(outcome)
    }

    fn spawn_viewer(&self, tasks: &mut JoinSet<TaskOutcome>, viewer: NewViewer) {
        let NewViewer { id, stream, rx } = viewer;

        let writer_id = id.clone();
        let writer_stream = Arc::clone(&stream);
        tasks.spawn(async move {
            let outcome = run_writer(writer_id.clone(), writer_stream, rx).await;
            TaskOutcome::Writer(writer_id, outcome)
        });

        let source = Arc::clone(&self.source);
        let source_write = Arc::clone(&self.source_write);
        tasks.spawn(async move {
            let outcome = run_pump(stream, source, source_write).await;
            TaskOutcome::Pump(id, outcome)
        });
    }

    /// Closes the session if it still has no viewers.
    ///
    /// Checked under the lifecycle lock so a concurrent attach either lands
    /// before (and keeps the session alive) or sees it closed.
    async fn close_if_headless(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.viewers.is_empty().await {
            return false;
        }
        lifecycle.phase = SessionPhase::Closed;
        lifecycle.attached = None;
        true
    }

    async fn teardown(
        &self,
        reason: &TerminationReason,
        mut tasks: JoinSet<TaskOutcome>,
        mux_task: AbortHandle,
        mut attach_rx: mpsc::UnboundedReceiver<NewViewer>,
    ) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.phase = SessionPhase::Closed;
            lifecycle.attached = None;
        }
        tracing::info!(session_id = %self.id, reason = %reason, "Session terminating");

        if let Err(e) = self.source.close().await {
            tracing::warn!(session_id = %self.id, error = %e, "Error closing source");
        }
        // Not every source wakes a pending read on close.
        mux_task.abort();

        // Viewers handed over but never started are still in the set, so
        // draining the set below closes them too.
        attach_rx.close();
        while attach_rx.try_recv().is_ok() {}

        // Writers flush their queues, then close their viewer, which ends the pumps.
        let detached = self.viewers.drain().await;
        let flushed = tokio::time::timeout(TEARDOWN_FLUSH_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Err(e) if !e.is_cancelled() => {
                        tracing::error!(session_id = %self.id, error = %e, "Session task failed");
                    }
                    _ => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::warn!(session_id = %self.id, "Viewers did not drain in time, aborting");
            tasks.abort_all();
        }

        for (viewer_id, stream) in detached {
            if let Err(e) = stream.close().await {
                tracing::debug!(
                    session_id = %self.id,
                    viewer_id = %viewer_id,
                    error = %e,
                    "Error closing viewer"
                );
            }
        }
        tasks.shutdown().await;
    }
}

impl fmt::Debug for SessionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAdapter")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Copies viewer input into the source until either side ends.
async fn run_pump(
    viewer: Arc<dyn Stream>,
    source: Arc<dyn Stream>,
    source_write: Arc<Mutex<()>>,
) -> PumpOutcome {
    loop {
        match viewer.produce().await {
            Ok(Some(chunk)) => {
                let _guard = source_write.lock().await;
                if let Err(e) = source.consume(&chunk).await {
                    return PumpOutcome::SourceWriteFailed(e);
                }
            }
            Ok(None) => return PumpOutcome::ViewerEnded,
            Err(e) => return PumpOutcome::ViewerFailed(e),
        }
    }
}
