//! Session manager.
//!
//! Implements the start-or-join control flow for incoming viewers: a viewer
//! that presents the ID of a live session is attached to it, anything else
//! starts a new container and a new session around its terminal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use protocol::Stream;
use tokio_util::task::TaskTracker;

use super::adapter::{SessionAdapter, SessionError, SessionId, SessionOptions, SessionStats};
use super::multiplexer::ViewerId;
use super::registry::SessionRegistry;
use crate::config::Config;
use crate::container::{ContainerHandle, ContainerRuntime, ImageBuilder, LifecycleHooks};

/// Default maximum number of live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

/// What a viewer asked for when connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenRequest {
    /// Session to join. Missing or unknown IDs start a new session.
    pub session_id: Option<SessionId>,
    /// Location of the source archive to build. Required to start a session.
    pub source_url: Option<String>,
    /// Command to run instead of the configured default.
    pub command: Option<Vec<String>>,
}

/// Result of [`SessionManager::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    pub session_id: SessionId,
    /// True if the viewer joined an existing session.
    pub joined: bool,
    /// The viewer's ID within a joined session. New sessions attach their
    /// first viewer when the runner connects.
    pub viewer_id: Option<ViewerId>,
}

/// Settings the manager applies to every session it starts.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Command run inside new containers.
    pub command: Vec<String>,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Options for each session adapter.
    pub session: SessionOptions,
}

impl ManagerConfig {
    /// Derives manager settings from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.container.command.clone(),
            max_sessions: config.session.max_sessions,
            session: config.session.options(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            command: vec!["/bin/bash".to_string()],
            max_sessions: DEFAULT_MAX_SESSIONS,
            session: SessionOptions::default(),
        }
    }
}

/// Holds one of the `max_sessions` slots while a session is being started.
struct StartSlot<'a>(&'a AtomicUsize);

impl Drop for StartSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Starts, joins and stops sessions.
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    builder: Arc<dyn ImageBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
    config: ManagerConfig,
    starting: AtomicUsize,
    shutting_down: AtomicBool,
    runners: TaskTracker,
}

impl SessionManager {
    /// Creates a manager that starts containers with `builder` and `runtime`.
    pub fn new(
        registry: Arc<SessionRegistry>,
        builder: Arc<dyn ImageBuilder>,
        runtime: Arc<dyn ContainerRuntime>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            builder,
            runtime,
            hooks: None,
            config,
            starting: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            runners: TaskTracker::new(),
        }
    }

    /// Installs lifecycle hooks on every container the manager starts.
    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Returns the registry of live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns a snapshot of every live session.
    pub async fn list(&self) -> Vec<SessionStats> {
        self.registry.list().await
    }

    /// Connects a viewer to a session.
    ///
    /// Joins the session named in `request` if it is live, otherwise starts a
    /// new one. The viewer learns the session ID through
    /// [`Stream::announce`] before any terminal output reaches it, and only
    /// for the session it actually ends up in.
    pub async fn open(
        &self,
        request: OpenRequest,
        viewer: Arc<dyn Stream>,
    ) -> Result<OpenedSession, SessionError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SessionError::InvalidSession(
                "daemon is shutting down".to_string(),
            ));
        }

        if let Some(id) = request.session_id.as_deref().filter(|id| !id.is_empty()) {
            match self.registry.find(id) {
                Some(adapter) => {
                    match adapter.attach_stream(Arc::clone(&viewer)).await {
                        Ok(viewer_id) => {
                            return Ok(OpenedSession {
                                session_id: id.to_string(),
                                joined: true,
                                viewer_id: Some(viewer_id),
                            });
                        }
                        Err(SessionError::SessionClosed(_)) => {
                            tracing::debug!(session_id = %id, "Session closed while joining, starting a new one");
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    tracing::debug!(session_id = %id, "Unknown session, starting a new one");
                }
            }
        }

        self.start(request, viewer).await
    }

    /// Starts a new session for `viewer`.
    async fn start(
        &self,
        request: OpenRequest,
        viewer: Arc<dyn Stream>,
    ) -> Result<OpenedSession, SessionError> {
        let source_url = request
            .source_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                SessionError::InvalidSession("a source URL is required to start a session".to_string())
            })?;

        let _slot = self.reserve_slot()?;

        let mut handle = ContainerHandle::new(Arc::clone(&self.builder), Arc::clone(&self.runtime));
        if let Some(hooks) = &self.hooks {
            handle = handle.with_hooks(Arc::clone(hooks));
        }
        let handle = Arc::new(handle);
        let session_id = handle.id().clone();

        tracing::info!(session_id = %session_id, source_url = %source_url, "Starting session");

        if let Err(e) = handle.build(&source_url).await {
            tracing::warn!(session_id = %session_id, error = %e, "Image build failed");
            handle.stop().await;
            return Err(SessionError::Build(e));
        }

        let command = request.command.unwrap_or_else(|| self.config.command.clone());
        let terminal = match handle.start(&command).await {
            Ok(terminal) => terminal,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Container start failed");
                handle.stop().await;
                return Err(SessionError::Start(e));
            }
        };

        let stopper = Arc::clone(&handle);
        let adapter = Arc::new(
            SessionAdapter::new(session_id.clone(), terminal, self.config.session.clone())
                .with_disconnect_hook(move || async move {
                    stopper.stop().await.into_result()?;
                    Ok::<(), anyhow::Error>(())
                }),
        );

        if let Err(e) = self.registry.create(session_id.clone(), Arc::clone(&adapter)) {
            handle.stop().await;
            return Err(e);
        }

        if let Err(e) = viewer.announce(&session_id, false).await {
            tracing::warn!(session_id = %session_id, error = %e, "Viewer left before the session started");
            self.registry.remove(&session_id);
            handle.stop().await;
            return Err(SessionError::StreamFailed(e));
        }

        // Shutdown may have swept the registry while this session was starting.
        if self.shutting_down.load(Ordering::SeqCst) {
            adapter.shutdown();
        }
        self.spawn_runner(adapter, viewer);

        Ok(OpenedSession {
            session_id,
            joined: false,
            viewer_id: None,
        })
    }

    fn reserve_slot(&self) -> Result<StartSlot<'_>, SessionError> {
        let starting = self.starting.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = StartSlot(&self.starting);
        if self.registry.len() + starting > self.config.max_sessions {
            tracing::warn!(max_sessions = self.config.max_sessions, "Session limit reached");
            return Err(SessionError::SessionLimit(self.config.max_sessions));
        }
        Ok(slot)
    }

    /// Runs a session to completion, then evicts it from the registry.
    fn spawn_runner(&self, adapter: Arc<SessionAdapter>, viewer: Arc<dyn Stream>) {
        let registry = Arc::clone(&self.registry);
        self.runners.spawn(async move {
            let session_id = adapter.id().clone();
            let result = adapter.connect(vec![viewer]).await;
            registry.remove(&session_id);

            match result {
                Ok(outcome) => tracing::info!(
                    session_id = %session_id,
                    reason = %outcome.reason,
                    chunks = outcome.chunks_broadcast,
                    "Session ended"
                ),
                Err(e) => tracing::error!(session_id = %session_id, error = %e, "Session ended with error"),
            }
        });
    }

    /// Stops every live session and waits until all of them are torn down.
    ///
    /// New sessions are refused from the moment this is called.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let ids = self.registry.ids();
        tracing::info!(sessions = ids.len(), "Shutting down sessions");
        for id in ids {
            if let Some(adapter) = self.registry.find(&id) {
                adapter.shutdown();
            }
        }

        self.runners.close();
        self.runners.wait().await;
    }
}
