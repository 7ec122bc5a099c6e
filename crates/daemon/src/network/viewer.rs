//! WebSocket viewer stream.
//!
//! Wraps one accepted WebSocket connection as a [`Stream`]:
//! - incoming text messages are base64 data frames, binary messages are raw
//!   terminal input
//! - outgoing terminal chunks are sent as base64 data frames
//! - [`Stream::announce`] sends a JSON `session` control frame

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{decode_text, encode_data, ControlFrame, Frame, Stream, StreamError, StreamFuture};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// How long closing waits to hand the close frame to the peer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Maps a WebSocket error onto the stream error taxonomy.
fn stream_error(err: WsError) -> StreamError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => StreamError::Closed,
        WsError::Io(e) => StreamError::from(e),
        other => StreamError::Transport(other.to_string()),
    }
}

/// A viewer connected over WebSocket.
pub struct WsViewer<S = TcpStream> {
    label: String,
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    source: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: CancellationToken,
}

impl<S> WsViewer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket. `label` identifies the viewer in logs.
    pub fn new(label: impl Into<String>, socket: WebSocketStream<S>) -> Self {
        let (sink, source) = socket.split();
        Self {
            label: label.into(),
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            closed: CancellationToken::new(),
        }
    }

    /// Returns the label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns whether the viewer has been closed locally.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn send(&self, message: WsMessage) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        // A peer that stops reading stalls the write; closing must still get through.
        tokio::select! {
            _ = self.closed.cancelled() => Err(StreamError::Closed),
            result = async { self.sink.lock().await.send(message).await } => {
                result.map_err(stream_error)
            }
        }
    }

    async fn send_control(&self, frame: &ControlFrame) -> Result<(), StreamError> {
        let json = frame.to_json()?;
        self.send(WsMessage::Text(json)).await
    }

    /// Reports a failure to the viewer as an `error` control frame.
    pub async fn send_error(&self, message: &str) -> Result<(), StreamError> {
        self.send_control(&ControlFrame::Error {
            message: message.to_string(),
        })
        .await
    }

    async fn next_chunk(&self) -> Result<Option<Bytes>, StreamError> {
        let mut source = self.source.lock().await;
        loop {
            let message = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                message = source.next() => message,
            };

            match message {
                None => return Ok(None),
                Some(Ok(WsMessage::Text(text))) => match decode_text(&text)? {
                    Frame::Data(chunk) if chunk.is_empty() => continue,
                    Frame::Data(chunk) => return Ok(Some(chunk)),
                    Frame::Control(control) => {
                        tracing::debug!(viewer = %self.label, frame = ?control, "Ignoring control frame from viewer");
                    }
                },
                Some(Ok(WsMessage::Binary(data))) => {
                    if !data.is_empty() {
                        return Ok(Some(Bytes::from(data)));
                    }
                }
                Some(Ok(WsMessage::Close(_))) => {
                    tracing::debug!(viewer = %self.label, "Viewer sent close frame");
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return match stream_error(e) {
                        StreamError::Closed => Ok(None),
                        other => Err(other),
                    };
                }
            }
        }
    }
}

impl<S> Stream for WsViewer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn produce(&self) -> StreamFuture<'_, Result<Option<Bytes>, StreamError>> {
        Box::pin(self.next_chunk())
    }

    fn consume<'a>(&'a self, chunk: &'a [u8]) -> StreamFuture<'a, Result<(), StreamError>> {
        Box::pin(self.send(WsMessage::Text(encode_data(chunk))))
    }

    fn close(&self) -> StreamFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(());
            }
            self.closed.cancel();

            // The peer may already be gone or not reading; closing is best-effort.
            let handshake = tokio::time::timeout(CLOSE_TIMEOUT, async {
                let mut sink = self.sink.lock().await;
                let _ = sink.send(WsMessage::Close(None)).await;
                let _ = sink.close().await;
            })
            .await;
            if handshake.is_err() {
                tracing::debug!(viewer = %self.label, "Viewer did not take the close frame in time");
            }

            tracing::debug!(viewer = %self.label, "Closed viewer connection");
            Ok(())
        })
    }

    fn announce<'a>(
        &'a self,
        session_id: &'a str,
        joined: bool,
    ) -> StreamFuture<'a, Result<(), StreamError>> {
        Box::pin(async move {
            self.send_control(&ControlFrame::Session {
                session_id: session_id.to_string(),
                joined,
            })
            .await
        })
    }
}
