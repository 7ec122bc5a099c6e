//! Container lifecycle management.
//!
//! A [`ContainerHandle`] owns one source-built container from image build to
//! cleanup. The heavy lifting is delegated to two collaborators:
//! - an [`ImageBuilder`] that turns a source archive location into an image
//! - a [`ContainerRuntime`] that runs an image with an attached pseudo-terminal
//!
//! The docker-backed implementations live in [`docker`]; tests substitute
//! their own.

pub mod docker;
pub mod journal;
pub mod pty;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use protocol::Stream;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use docker::{DockerBuilder, DockerRuntime};
pub use journal::{RunEvent, RunJournal, RunRecord};
pub use pty::PtyStream;

/// Unique identifier for a container. Doubles as the session identifier.
pub type ContainerId = String;

/// Boxed future returned by the container collaborator traits.
pub type ContainerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifier of a built image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageId(pub String);

impl ImageId {
    /// Returns the image reference as passed to the runtime.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur while managing a container.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Fetching, unpacking or building the source failed.
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Launching the container or its start hook failed.
    #[error("start failed: {0}")]
    StartFailed(String),

    /// The operation is not valid in the handle's current state.
    #[error("container {id} is {state}, expected {expected}")]
    InvalidState {
        id: ContainerId,
        state: ContainerState,
        expected: ContainerState,
    },

    /// A runtime command (kill, remove, ...) failed.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A lifecycle hook failed.
    #[error("lifecycle hook failed: {0}")]
    Hook(String),

    /// Cleanup finished with errors.
    #[error("cleanup incomplete: {0}")]
    Cleanup(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a container handle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContainerState {
    /// No image has been built yet.
    Unbuilt,
    /// The image is built but nothing is running.
    Built,
    /// The container is running with an attached terminal.
    Running,
    /// All resources have been released.
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Unbuilt => "unbuilt",
            ContainerState::Built => "built",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Builds images from source archives.
pub trait ImageBuilder: Send + Sync {
    /// Fetches and unpacks the archive at `source`, then builds it as `tag`.
    fn build<'a>(
        &'a self,
        source: &'a str,
        tag: &'a str,
    ) -> ContainerFuture<'a, Result<ImageId, ContainerError>>;

    /// Deletes a previously built image.
    fn remove_image<'a>(&'a self, image: &'a ImageId)
        -> ContainerFuture<'a, Result<(), ContainerError>>;
}

/// Runs images as isolated processes.
pub trait ContainerRuntime: Send + Sync {
    /// Starts `image` under the stable `name`, running `command` on a PTY.
    ///
    /// Returns the terminal as a stream.
    fn run<'a>(
        &'a self,
        image: &'a ImageId,
        name: &'a str,
        command: &'a [String],
    ) -> ContainerFuture<'a, Result<Arc<dyn Stream>, ContainerError>>;

    /// Kills the container called `name`. Killing a stopped container succeeds.
    fn kill<'a>(&'a self, name: &'a str) -> ContainerFuture<'a, Result<(), ContainerError>>;

    /// Removes the container called `name` and its storage.
    fn remove<'a>(&'a self, name: &'a str) -> ContainerFuture<'a, Result<(), ContainerError>>;
}

/// Side effects run when a container starts and stops.
pub trait LifecycleHooks: Send + Sync {
    /// Called after the container is running, before its terminal is handed out.
    fn on_start<'a>(&'a self, container_id: &'a str) -> ContainerFuture<'a, anyhow::Result<()>>;

    /// Called once the container has been stopped.
    fn on_stop<'a>(&'a self, container_id: &'a str) -> ContainerFuture<'a, anyhow::Result<()>>;
}

/// Outcome of [`ContainerHandle::stop`].
///
/// Cleanup is best-effort: every step is attempted and failures are
/// collected here instead of aborting the stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// The container that was stopped.
    pub container_id: ContainerId,
    /// True if the handle was already stopped and nothing was done.
    pub already_stopped: bool,
    /// Cleanup steps that failed.
    pub errors: Vec<String>,
}

impl StopReport {
    fn new(container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            already_stopped: false,
            errors: Vec::new(),
        }
    }

    /// Returns true if every cleanup step succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts collected cleanup failures into an error.
    pub fn into_result(self) -> Result<(), ContainerError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ContainerError::Cleanup(self.errors.join("; ")))
        }
    }
}

struct HandleInner {
    state: ContainerState,
    image: Option<ImageId>,
    terminal: Option<Arc<dyn Stream>>,
}

/// Owns the lifecycle of one container: build, start, stop.
pub struct ContainerHandle {
    id: ContainerId,
    builder: Arc<dyn ImageBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
    inner: Mutex<HandleInner>,
}

impl ContainerHandle {
    /// Creates an unbuilt handle with a fresh identifier.
    pub fn new(builder: Arc<dyn ImageBuilder>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            builder,
            runtime,
            hooks: None,
            inner: Mutex::new(HandleInner {
                state: ContainerState::Unbuilt,
                image: None,
                terminal: None,
            }),
        }
    }

    /// Installs lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Returns the container ID.
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Returns the current lifecycle state.
    pub async fn state(&self) -> ContainerState {
        self.inner.lock().await.state
    }

    /// Returns the built image, if any.
    pub async fn image(&self) -> Option<ImageId> {
        self.inner.lock().await.image.clone()
    }

    /// Image tag used for this container's build.
    fn image_tag(&self) -> String {
        format!("podterm/{}", self.id)
    }

    /// Builds the image for this container from a source archive location.
    pub async fn build(&self, source: &str) -> Result<ImageId, ContainerError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ContainerState::Unbuilt {
            return Err(ContainerError::InvalidState {
                id: self.id.clone(),
                state: inner.state,
                expected: ContainerState::Unbuilt,
            });
        }

        tracing::info!(container_id = %self.id, source = %source, "Building image");

        let image = self
            .builder
            .build(source, &self.image_tag())
            .await
            .map_err(|e| match e {
                ContainerError::BuildFailed(_) => e,
                other => ContainerError::BuildFailed(other.to_string()),
            })?;

        tracing::info!(container_id = %self.id, image = %image, "Image built");

        inner.image = Some(image.clone());
        inner.state = ContainerState::Built;
        Ok(image)
    }

    /// Starts the built image running `command` and returns its terminal.
    ///
    /// The start hook runs before the terminal is returned. If it fails the
    /// container is torn down again and `StartFailed` is returned.
    pub async fn start(&self, command: &[String]) -> Result<Arc<dyn Stream>, ContainerError> {
        let mut inner = self.inner.lock().await;
        let image = match (inner.state, inner.image.clone()) {
            (ContainerState::Built, Some(image)) => image,
            (state, _) => {
                return Err(ContainerError::InvalidState {
                    id: self.id.clone(),
                    state,
                    expected: ContainerState::Built,
                })
            }
        };

        let terminal = self
            .runtime
            .run(&image, &self.id, command)
            .await
            .map_err(|e| match e {
                ContainerError::StartFailed(_) => e,
                other => ContainerError::StartFailed(other.to_string()),
            })?;

        inner.terminal = Some(Arc::clone(&terminal));
        inner.state = ContainerState::Running;

        if let Some(hooks) = &self.hooks {
            if let Err(e) = hooks.on_start(&self.id).await {
                tracing::warn!(
                    container_id = %self.id,
                    error = %e,
                    "Start hook failed, stopping container"
                );
                let mut report = StopReport::new(&self.id);
                self.release(&mut inner, &mut report).await;
                inner.state = ContainerState::Stopped;
                return Err(ContainerError::StartFailed(format!("start hook failed: {e}")));
            }
        }

        tracing::info!(container_id = %self.id, image = %image, "Container started");
        Ok(terminal)
    }

    /// Stops the container and releases everything it holds.
    ///
    /// Safe to call any number of times; only the first call has effects.
    pub async fn stop(&self) -> StopReport {
        let mut inner = self.inner.lock().await;
        if inner.state == ContainerState::Stopped {
            let mut report = StopReport::new(&self.id);
            report.already_stopped = true;
            return report;
        }

        let was_running = inner.state == ContainerState::Running;
        let mut report = StopReport::new(&self.id);
        self.release(&mut inner, &mut report).await;
        inner.state = ContainerState::Stopped;

        if was_running {
            if let Some(hooks) = &self.hooks {
                if let Err(e) = hooks.on_stop(&self.id).await {
                    report.errors.push(format!("stop hook: {e}"));
                }
            }
        }

        for error in &report.errors {
            tracing::warn!(container_id = %self.id, error = %error, "Cleanup step failed");
        }
        tracing::info!(
            container_id = %self.id,
            clean = report.is_clean(),
            "Container stopped"
        );

        report
    }

    async fn release(&self, inner: &mut HandleInner, report: &mut StopReport) {
        if let Some(terminal) = inner.terminal.take() {
            if let Err(e) = terminal.close().await {
                report.errors.push(format!("close terminal: {e}"));
            }
        }

        if inner.state == ContainerState::Running {
            if let Err(e) = self.runtime.kill(&self.id).await {
                report.errors.push(format!("kill: {e}"));
            }
            if let Err(e) = self.runtime.remove(&self.id).await {
                report.errors.push(format!("remove: {e}"));
            }
        }

        if let Some(image) = inner.image.take() {
            if let Err(e) = self.builder.remove_image(&image).await {
                report.errors.push(format!("remove image: {e}"));
            }
        }
    }
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::MemoryStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBuilder {
        fail: bool,
        builds: AtomicUsize,
        removed: AtomicUsize,
    }

    impl ImageBuilder for FakeBuilder {
        fn build<'a>(
            &'a self,
            _source: &'a str,
            tag: &'a str,
        ) -> ContainerFuture<'a, Result<ImageId, ContainerError>> {
            Box::pin(async move {
                self.builds.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(ContainerError::Runtime("download refused".to_string()))
                } else {
                    Ok(ImageId(tag.to_string()))
                }
            })
        }

        fn remove_image<'a>(
            &'a self,
            _image: &'a ImageId,
        ) -> ContainerFuture<'a, Result<(), ContainerError>> {
            Box::pin(async move {
                self.removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        fail_kill: bool,
        kills: AtomicUsize,
        removes: AtomicUsize,
    }

    impl ContainerRuntime for FakeRuntime {
        fn run<'a>(
            &'a self,
            _image: &'a ImageId,
            _name: &'a str,
            _command: &'a [String],
        ) -> ContainerFuture<'a, Result<Arc<dyn Stream>, ContainerError>> {
            Box::pin(async move {
                let (terminal, _remote) = MemoryStream::pair();
                Ok(Arc::new(terminal) as Arc<dyn Stream>)
            })
        }

        fn kill<'a>(&'a self, _name: &'a str) -> ContainerFuture<'a, Result<(), ContainerError>> {
            Box::pin(async move {
                self.kills.fetch_add(1, Ordering::SeqCst);
                if self.fail_kill {
                    Err(ContainerError::Runtime("kill refused".to_string()))
                } else {
                    Ok(())
                }
            })
        }

        fn remove<'a>(&'a self, _name: &'a str) -> ContainerFuture<'a, Result<(), ContainerError>> {
            Box::pin(async move {
                self.removes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[derive(Default)]
    struct FakeHooks {
        fail_start: bool,
        started: AtomicBool,
        stops: AtomicUsize,
    }

    impl LifecycleHooks for FakeHooks {
        fn on_start<'a>(&'a self, _id: &'a str) -> ContainerFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                if self.fail_start {
                    anyhow::bail!("database unavailable");
                }
                self.started.store(true, Ordering::SeqCst);
                Ok(())
            })
        }

        fn on_stop<'a>(&'a self, _id: &'a str) -> ContainerFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn command() -> Vec<String> {
        vec!["/bin/bash".to_string()]
    }

    #[tokio::test]
    async fn test_handle_lifecycle() {
        let builder = Arc::new(FakeBuilder::default());
        let runtime = Arc::new(FakeRuntime::default());
        let handle = ContainerHandle::new(builder.clone(), runtime.clone());

        assert_eq!(handle.state().await, ContainerState::Unbuilt);

        let image = handle.build("https://example.com/repo.tgz").await.unwrap();
        assert_eq!(image.as_str(), format!("podterm/{}", handle.id()));
        assert_eq!(handle.state().await, ContainerState::Built);

        handle.start(&command()).await.unwrap();
        assert_eq!(handle.state().await, ContainerState::Running);

        let report = handle.stop().await;
        assert!(report.is_clean());
        assert!(!report.already_stopped);
        assert_eq!(handle.state().await, ContainerState::Stopped);
        assert_eq!(runtime.kills.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.removes.load(Ordering::SeqCst), 1);
        assert_eq!(builder.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::default());
        let hooks = Arc::new(FakeHooks::default());
        let handle = ContainerHandle::new(Arc::new(FakeBuilder::default()), runtime.clone())
            .with_hooks(hooks.clone());

        handle.build("src").await.unwrap();
        handle.start(&command()).await.unwrap();

        let first = handle.stop().await;
        let second = handle.stop().await;

        assert!(!first.already_stopped);
        assert!(second.already_stopped);
        assert!(second.is_clean());
        assert_eq!(runtime.kills.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_failure_maps_to_build_failed() {
        let builder = Arc::new(FakeBuilder {
            fail: true,
            ..Default::default()
        });
        let handle = ContainerHandle::new(builder, Arc::new(FakeRuntime::default()));

        let err = handle.build("src").await.unwrap_err();
        assert!(matches!(err, ContainerError::BuildFailed(_)));
        assert_eq!(handle.state().await, ContainerState::Unbuilt);
    }

    #[tokio::test]
    async fn test_build_twice_is_invalid() {
        let handle = ContainerHandle::new(
            Arc::new(FakeBuilder::default()),
            Arc::new(FakeRuntime::default()),
        );
        handle.build("src").await.unwrap();

        let err = handle.build("src").await.unwrap_err();
        assert!(matches!(
            err,
            ContainerError::InvalidState {
                state: ContainerState::Built,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_start_requires_build() {
        let handle = ContainerHandle::new(
            Arc::new(FakeBuilder::default()),
            Arc::new(FakeRuntime::default()),
        );

        let err = handle.start(&command()).await.err().unwrap();
        assert!(matches!(
            err,
            ContainerError::InvalidState {
                expected: ContainerState::Built,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_start_hook_failure_stops_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let hooks = Arc::new(FakeHooks {
            fail_start: true,
            ..Default::default()
        });
        let handle = ContainerHandle::new(Arc::new(FakeBuilder::default()), runtime.clone())
            .with_hooks(hooks.clone());

        handle.build("src").await.unwrap();
        let err = handle.start(&command()).await.err().unwrap();

        assert!(matches!(err, ContainerError::StartFailed(_)));
        assert_eq!(handle.state().await, ContainerState::Stopped);
        assert_eq!(runtime.kills.load(Ordering::SeqCst), 1);
        // The run was never recorded, so there is nothing to end.
        assert_eq!(hooks.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_errors_are_reported_not_raised() {
        let runtime = Arc::new(FakeRuntime {
            fail_kill: true,
            ..Default::default()
        });
        let handle = ContainerHandle::new(Arc::new(FakeBuilder::default()), runtime.clone());
        handle.build("src").await.unwrap();
        handle.start(&command()).await.unwrap();

        let report = handle.stop().await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("kill"));
        // The remaining steps still ran.
        assert_eq!(runtime.removes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state().await, ContainerState::Stopped);
        assert!(matches!(report.into_result(), Err(ContainerError::Cleanup(_))));
    }

    #[tokio::test]
    async fn test_stop_unbuilt_handle() {
        let handle = ContainerHandle::new(
            Arc::new(FakeBuilder::default()),
            Arc::new(FakeRuntime::default()),
        );

        let report = handle.stop().await;
        assert!(report.is_clean());
        assert_eq!(handle.state().await, ContainerState::Stopped);
    }

    #[test]
    fn test_container_ids_are_unique() {
        let a = ContainerHandle::new(
            Arc::new(FakeBuilder::default()),
            Arc::new(FakeRuntime::default()),
        );
        let b = ContainerHandle::new(
            Arc::new(FakeBuilder::default()),
            Arc::new(FakeRuntime::default()),
        );
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 36);
    }
}
