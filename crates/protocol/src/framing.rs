//! Frame codec for viewer connections.
//!
//! # Frame Format
//!
//! Viewers talk to the daemon over a message-oriented transport. Each text
//! message is one of:
//! - a **data frame**: the standard base64 encoding of a terminal chunk
//! - a **control frame**: a JSON object tagged by its `type` field
//!
//! Base64 output never starts with `{`, so the first non-whitespace byte is
//! enough to tell the two apart. Binary messages carry raw terminal bytes and
//! are accepted as input only; output is always sent as data frames.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Out-of-band messages exchanged with a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Tells the viewer which session it is attached to.
    ///
    /// `joined` is false for the viewer that started the session; that viewer
    /// hands `session_id` to anyone who should be able to join.
    Session { session_id: String, joined: bool },

    /// The daemon could not open a session for this viewer.
    Error { message: String },
}

impl ControlFrame {
    /// Serializes the control frame to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal bytes.
    Data(Bytes),
    /// An out-of-band control message.
    Control(ControlFrame),
}

/// Encodes a terminal chunk as a data frame.
pub fn encode_data(chunk: &[u8]) -> String {
    STANDARD.encode(chunk)
}

/// Decodes a text frame into terminal bytes or a control message.
pub fn decode_text(text: &str) -> Result<Frame> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        let control: ControlFrame = serde_json::from_str(trimmed)?;
        return Ok(Frame::Control(control));
    }

    let data = STANDARD.decode(trimmed)?;
    Ok(Frame::Data(Bytes::from(data)))
}
