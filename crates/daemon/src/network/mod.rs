//! Network module for viewer connections.
//!
//! Viewers reach the daemon over WebSocket. [`server`] accepts connections
//! and routes each one to a session, [`viewer`] adapts a single connection
//! to the [`protocol::Stream`] contract.

pub mod server;
pub mod viewer;

pub use server::{parse_request, RequestError, Server, PTY_PATH};
pub use viewer::WsViewer;
