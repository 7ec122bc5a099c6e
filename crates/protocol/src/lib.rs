//! # Podterm Protocol Library
//!
//! This crate defines the pieces shared by everything that moves terminal
//! bytes around in Podterm:
//!
//! - **Stream capability**: the [`Stream`] trait implemented by container
//!   terminals and viewer transports, plus an in-memory [`MemoryStream`] pair
//! - **Viewer framing**: base64 data frames and JSON control frames used on
//!   viewer connections
//! - **Errors**: [`StreamError`] for stream calls, [`ProtocolError`] for framing
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   produce/consume   ┌──────────────────┐
//! │ PTY (source) │ ◄─────────────────► │  Session adapter │
//! └──────────────┘                     └────────┬─────────┘
//!                                               │ produce/consume
//!                                  ┌────────────┼────────────┐
//!                                  ▼            ▼            ▼
//!                              viewer 1     viewer 2     viewer N
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{MemoryStream, Stream};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (terminal, remote) = MemoryStream::pair();
//! remote.consume(b"hello").await.unwrap();
//! let chunk = terminal.produce().await.unwrap();
//! assert_eq!(chunk.as_deref(), Some(&b"hello"[..]));
//! # }
//! ```

pub mod error;
pub mod framing;
pub mod stream;

pub use error::{ProtocolError, Result, StreamError};
pub use framing::{decode_text, encode_data, ControlFrame, Frame};
pub use stream::{MemoryStream, Stream, StreamFuture};
