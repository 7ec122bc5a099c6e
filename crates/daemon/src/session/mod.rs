//! Session management module.
//!
//! A session couples the terminal of one running container with any number
//! of viewers. This module provides the broadcast multiplexer, the adapter
//! that owns a session's lifecycle, the registry of live sessions and the
//! manager that starts and joins them.

pub mod adapter;
pub mod manager;
pub mod multiplexer;
pub mod registry;

pub use adapter::{
    PumpOutcome, SessionAdapter, SessionError, SessionId, SessionOptions, SessionOutcome,
    SessionPhase, SessionStats, TerminationReason,
};
pub use manager::{ManagerConfig, OpenRequest, OpenedSession, SessionManager};
pub use multiplexer::{BroadcastMux, MuxOutcome, ViewerId, ViewerSet, WriterOutcome};
pub use registry::SessionRegistry;
