//! Error types for the protocol crate.

use thiserror::Error;

/// Failure of a single `produce`/`consume`/`close` call on a stream.
///
/// The session layer decides what a failure means: on a viewer stream it
/// evicts that viewer, on the source stream it ends the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The stream was closed locally or by its peer.
    #[error("stream closed")]
    Closed,

    /// Reading or writing the underlying transport failed.
    #[error("stream I/O failed: {0}")]
    Io(String),

    /// A received frame could not be decoded into a chunk.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// The transport reported a protocol-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl StreamError {
    /// Returns true if this error only reports that the stream is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamError::Closed)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => StreamError::Closed,
            _ => StreamError::Io(err.to_string()),
        }
    }
}

impl From<ProtocolError> for StreamError {
    fn from(err: ProtocolError) -> Self {
        StreamError::Decode(err.to_string())
    }
}

/// Errors raised while encoding or decoding viewer frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A data frame did not contain valid base64.
    #[error("invalid base64 payload: {0}")]
    InvalidPayload(String),

    /// A control frame could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A control frame could not be parsed.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidPayload(err.to_string())
    }
}
