//! The byte-stream capability shared by terminals and viewer transports.
//!
//! A [`Stream`] produces a lazy sequence of byte chunks and accepts chunks
//! for delivery. The PTY of a running container, a WebSocket viewer and the
//! in-memory [`MemoryStream`] all implement it, so the session layer never
//! needs to know what sits behind a stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::StreamError;

/// Boxed future returned by [`Stream`] methods.
pub type StreamFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional stream of byte chunks.
///
/// Within one stream, chunks are delivered in the order they were consumed,
/// exactly once. Methods take `&self`; implementations serialize access to
/// their halves internally so a stream can be shared behind an `Arc`.
pub trait Stream: Send + Sync {
    /// Waits for the next chunk.
    ///
    /// Returns `Ok(None)` once the stream has ended.
    fn produce(&self) -> StreamFuture<'_, Result<Option<Bytes>, StreamError>>;

    /// Delivers one chunk. The chunk is written whole or not at all.
    fn consume<'a>(&'a self, chunk: &'a [u8]) -> StreamFuture<'a, Result<(), StreamError>>;

    /// Releases the underlying transport.
    ///
    /// Pending and future `produce` calls return end-of-stream or an error.
    /// Closing twice is a no-op.
    fn close(&self) -> StreamFuture<'_, Result<(), StreamError>>;

    /// Tells the remote end which session it is attached to.
    ///
    /// Called once, before any session output is delivered. Transports with
    /// no out-of-band channel keep the default no-op.
    fn announce<'a>(
        &'a self,
        _session_id: &'a str,
        _joined: bool,
    ) -> StreamFuture<'a, Result<(), StreamError>> {
        Box::pin(async { Ok(()) })
    }
}

/// One end of an in-memory stream pair.
///
/// Whatever one end consumes, the other end produces. Closing an end ends
/// the peer's `produce` once buffered chunks are drained and makes the
/// peer's `consume` fail with [`StreamError::Closed`].
pub struct MemoryStream {
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: watch::Sender<bool>,
    closed_flag: AtomicBool,
    announced: StdMutex<Option<(String, bool)>>,
}

impl MemoryStream {
    /// Creates a connected pair of streams.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_rx, b_tx), Self::new(b_rx, a_tx))
    }

    fn new(inbound: mpsc::UnboundedReceiver<Bytes>, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inbound: Mutex::new(inbound),
            outbound: StdMutex::new(Some(outbound)),
            closed,
            closed_flag: AtomicBool::new(false),
            announced: StdMutex::new(None),
        }
    }

    /// Returns whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }

    /// Returns the last `(session_id, joined)` pair announced on this end.
    pub fn announced(&self) -> Option<(String, bool)> {
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Stream for MemoryStream {
    fn produce(&self) -> StreamFuture<'_, Result<Option<Bytes>, StreamError>> {
        Box::pin(async move {
            let mut closed = self.closed.subscribe();
            let mut inbound = self.inbound.lock().await;

            if self.is_closed() {
                inbound.close();
                return Ok(None);
            }

            tokio::select! {
                chunk = inbound.recv() => Ok(chunk),
                _ = closed.wait_for(|closed| *closed) => {
                    inbound.close();
                    Ok(None)
                }
            }
        })
    }

    fn consume<'a>(&'a self, chunk: &'a [u8]) -> StreamFuture<'a, Result<(), StreamError>> {
        Box::pin(async move {
            let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            match outbound.as_ref() {
                Some(tx) => tx
                    .send(Bytes::copy_from_slice(chunk))
                    .map_err(|_| StreamError::Closed),
                None => Err(StreamError::Closed),
            }
        })
    }

    fn close(&self) -> StreamFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            if self.closed_flag.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            self.outbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            self.closed.send_replace(true);

            // A blocked produce holds the receiver and closes it on wake-up.
            if let Ok(mut inbound) = self.inbound.try_lock() {
                inbound.close();
            }
            Ok(())
        })
    }

    fn announce<'a>(
        &'a self,
        session_id: &'a str,
        joined: bool,
    ) -> StreamFuture<'a, Result<(), StreamError>> {
        Box::pin(async move {
            *self.announced.lock().unwrap_or_else(|e| e.into_inner()) =
                Some((session_id.to_string(), joined));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryStream::pair();

        a.consume(b"one").await.unwrap();
        a.consume(b"two").await.unwrap();

        assert_eq!(b.produce().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(b.produce().await.unwrap(), Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_pair_is_bidirectional() {
        let (a, b) = MemoryStream::pair();

        b.consume(b"pong").await.unwrap();
        assert_eq!(a.produce().await.unwrap(), Some(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends_peer() {
        let (a, b) = MemoryStream::pair();

        a.consume(b"last").await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.produce().await.unwrap(), Some(Bytes::from_static(b"last")));
        assert_eq!(b.produce().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_produce() {
        let (a, _b) = MemoryStream::pair();
        let a = Arc::new(a);

        let reader = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.produce().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await.unwrap();

        let result = timeout(Duration::from_secs(1), reader)
            .await
            .expect("produce did not return after close")
            .unwrap();
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_consume_after_close_fails() {
        let (a, b) = MemoryStream::pair();
        a.close().await.unwrap();

        assert_eq!(a.consume(b"x").await, Err(StreamError::Closed));

        // The peer's writes land on a closed receiver.
        assert_eq!(b.consume(b"x").await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = MemoryStream::pair();
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_announce_is_recorded() {
        let (a, _b) = MemoryStream::pair();
        assert_eq!(a.announced(), None);

        a.announce("session-1", false).await.unwrap();
        assert_eq!(a.announced(), Some(("session-1".to_string(), false)));
    }
}
