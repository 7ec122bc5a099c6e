//! # Podterm Daemon Library
//!
//! Shared terminals inside source-built containers.
//!
//! ## Overview
//!
//! A viewer asks for a terminal by naming a source archive. The daemon builds
//! an image from it, runs a container with a pseudo-terminal attached and
//! streams the terminal to the viewer. Further viewers join the same session
//! by its ID: every viewer sees the same output and every viewer can type.
//!
//! - **Container lifecycle**: build, start and best-effort cleanup
//! - **Session multiplexing**: one terminal broadcast to many viewers, with
//!   slow or broken viewers evicted without disturbing the rest
//! - **Session registry**: live sessions by ID, evicted when they end
//! - **Viewer endpoint**: WebSocket with base64 data frames
//!
//! ## Architecture
//!
//! ```text
//!  viewers ──ws──► network::Server ──► SessionManager ──► SessionRegistry
//!                                            │
//!                                            ▼
//!                        ContainerHandle ◄── SessionAdapter ──► BroadcastMux
//!                        (docker + pty)        (pumps, writers, teardown)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`container`]: Image build, container runtime and PTY stream
//! - [`session`]: Multiplexer, adapter, registry and manager
//! - [`network`]: WebSocket viewer endpoint

pub mod config;
pub mod container;
pub mod network;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export container types for convenience
pub use container::{
    ContainerError, ContainerHandle, ContainerId, ContainerRuntime, ContainerState, DockerBuilder,
    DockerRuntime, ImageBuilder, ImageId, LifecycleHooks, RunJournal, StopReport,
};

// Re-export session types for convenience
pub use session::{
    OpenRequest, OpenedSession, SessionAdapter, SessionError, SessionId, SessionManager,
    SessionOptions, SessionOutcome, SessionRegistry, TerminationReason,
};

// Re-export network types for convenience
pub use network::{Server, WsViewer};
