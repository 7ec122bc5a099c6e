//! Session output multiplexer.
//!
//! This module fans the output of a session's source stream out to every
//! attached viewer. Each viewer owns a bounded queue drained by its own writer
//! task, so the broadcast loop never waits on a viewer. A viewer whose queue
//! fills up is evicted as a slow consumer: chunks are never dropped or
//! reordered for a viewer that stays attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use protocol::{Stream, StreamError};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Unique identifier for a viewer within a session.
pub type ViewerId = String;

/// Default capacity of a viewer's outbound queue, in chunks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Why a viewer was removed by the broadcast loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// The viewer's queue was full.
    SlowConsumer,
    /// The viewer's writer has already exited.
    Disconnected,
}

/// A viewer removed during a broadcast.
pub struct Evicted {
    pub id: ViewerId,
    pub stream: Arc<dyn Stream>,
    pub cause: EvictionCause,
}

/// Result of one broadcast.
#[derive(Default)]
pub struct BroadcastReport {
    /// Number of viewers the chunk was queued for.
    pub delivered: usize,
    /// Viewers removed from the set while broadcasting.
    pub evicted: Vec<Evicted>,
}

/// How a viewer writer task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterOutcome {
    /// The queue was closed and every queued chunk was delivered.
    Drained,
    /// Delivering a chunk to the viewer failed.
    Failed(StreamError),
}

/// How the broadcast loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxOutcome {
    /// The source reported end of stream.
    SourceEnded,
    /// Reading the source failed.
    SourceFailed(StreamError),
}

struct ViewerEntry {
    stream: Arc<dyn Stream>,
    tx: mpsc::Sender<Bytes>,
    delivered: u64,
}

/// The live set of viewers of one session.
///
/// Registration and the per-chunk snapshot take the same lock, so a viewer
/// registered while a chunk is being broadcast receives either that chunk or
/// the next one, never a partial or duplicated chunk.
pub struct ViewerSet {
    viewers: RwLock<HashMap<ViewerId, ViewerEntry>>,
    capacity: usize,
}

impl ViewerSet {
    /// Creates an empty set whose viewers get queues of `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers a viewer.
    ///
    /// Returns its id and the receiving end of its outbound queue, which the
    /// caller hands to [`run_writer`].
    pub async fn insert(&self, stream: Arc<dyn Stream>) -> (ViewerId, mpsc::Receiver<Bytes>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.capacity);
        self.viewers.write().await.insert(
            id.clone(),
            ViewerEntry {
                stream,
                tx,
                delivered: 0,
            },
        );
        tracing::debug!(viewer_id = %id, "Added viewer");
        (id, rx)
    }

    /// Removes a viewer and returns its stream.
    ///
    /// Dropping the queue sender lets the writer flush what is already queued
    /// and then close the viewer.
    pub async fn remove(&self, id: &str) -> Option<Arc<dyn Stream>> {
        self.viewers.write().await.remove(id).map(|entry| entry.stream)
    }

    /// Removes every viewer and returns their streams.
    pub async fn drain(&self) -> Vec<(ViewerId, Arc<dyn Stream>)> {
        self.viewers
            .write()
            .await
            .drain()
            .map(|(id, entry)| (id, entry.stream))
            .collect()
    }

    /// Returns the number of registered viewers.
    pub async fn len(&self) -> usize {
        self.viewers.read().await.len()
    }

    /// Returns true if no viewer is registered.
    pub async fn is_empty(&self) -> bool {
        self.viewers.read().await.is_empty()
    }

    /// Returns the ids of all registered viewers.
    pub async fn ids(&self) -> Vec<ViewerId> {
        self.viewers.read().await.keys().cloned().collect()
    }

    /// Returns the number of chunks queued for each viewer so far.
    pub async fn delivered(&self) -> HashMap<ViewerId, u64> {
        self.viewers
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.delivered))
            .collect()
    }

    /// Queues `chunk` for every registered viewer.
    ///
    /// Viewers whose queue is full or whose writer is gone are removed and
    /// returned in the report; closing them is up to the caller.
    pub async fn broadcast(&self, chunk: Bytes) -> BroadcastReport {
        let mut viewers = self.viewers.write().await;
        let mut report = BroadcastReport::default();
        let mut evicted = Vec::new();

        for (id, entry) in viewers.iter_mut() {
            match entry.tx.try_send(chunk.clone()) {
                Ok(()) => {
                    entry.delivered += 1;
                    report.delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    evicted.push((id.clone(), EvictionCause::SlowConsumer));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push((id.clone(), EvictionCause::Disconnected));
                }
            }
        }

        for (id, cause) in evicted {
            if let Some(entry) = viewers.remove(&id) {
                report.evicted.push(Evicted {
                    id,
                    stream: entry.stream,
                    cause,
                });
            }
        }

        report
    }
}

impl Default for ViewerSet {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Drains a viewer's queue into the viewer stream.
///
/// Runs until the queue is closed (the viewer was removed from its set) or a
/// write fails. The viewer stream is closed on the way out either way, which
/// also ends the viewer's input pump.
pub async fn run_writer(
    id: ViewerId,
    stream: Arc<dyn Stream>,
    mut rx: mpsc::Receiver<Bytes>,
) -> WriterOutcome {
    let mut outcome = WriterOutcome::Drained;

    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stream.consume(&chunk).await {
            tracing::debug!(viewer_id = %id, error = %e, "Viewer write failed");
            outcome = WriterOutcome::Failed(e);
            break;
        }
    }

    if let Err(e) = stream.close().await {
        tracing::debug!(viewer_id = %id, error = %e, "Error closing viewer");
    }
    outcome
}

/// Reads the source and broadcasts every chunk to a [`ViewerSet`].
pub struct BroadcastMux {
    source: Arc<dyn Stream>,
    viewers: Arc<ViewerSet>,
    chunks: Arc<AtomicU64>,
}

impl BroadcastMux {
    /// Creates a mux over `source` and `viewers`.
    pub fn new(source: Arc<dyn Stream>, viewers: Arc<ViewerSet>) -> Self {
        Self {
            source,
            viewers,
            chunks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counts broadcast chunks in `counter` instead of a private counter.
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.chunks = counter;
        self
    }

    /// Returns a shared counter of chunks broadcast so far.
    pub fn chunk_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.chunks)
    }

    /// Runs the broadcast loop until the source ends or fails.
    ///
    /// Viewer failures never end the loop: the viewer is evicted and logged,
    /// its close runs in the background, and delivery to the others continues.
    pub async fn run(self) -> MuxOutcome {
        loop {
            match self.source.produce().await {
                Ok(Some(chunk)) => {
                    self.chunks.fetch_add(1, Ordering::Relaxed);
                    let report = self.viewers.broadcast(chunk).await;
                    for evicted in report.evicted {
                        match evicted.cause {
                            EvictionCause::SlowConsumer => tracing::warn!(
                                viewer_id = %evicted.id,
                                "Viewer queue full, evicting slow viewer"
                            ),
                            EvictionCause::Disconnected => tracing::debug!(
                                viewer_id = %evicted.id,
                                "Removed disconnected viewer"
                            ),
                        }
                        // Closing waits on the viewer's transport, which may be the
                        // very thing that is stuck.
                        tokio::spawn(async move {
                            if let Err(e) = evicted.stream.close().await {
                                tracing::debug!(viewer_id = %evicted.id, error = %e, "Error closing viewer");
                            }
                        });
                    }
                }
                Ok(None) => {
                    tracing::debug!("Source ended - broadcast loop ending");
                    return MuxOutcome::SourceEnded;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Source read failed - broadcast loop ending");
                    return MuxOutcome::SourceFailed(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::MemoryStream;
    use std::time::Duration;
    use tokio::time::timeout;

    /// A viewer whose writes never complete.
    struct StalledStream;

    impl Stream for StalledStream {
        fn produce(&self) -> protocol::StreamFuture<'_, Result<Option<Bytes>, StreamError>> {
            Box::pin(std::future::pending())
        }

        fn consume<'a>(
            &'a self,
            _chunk: &'a [u8],
        ) -> protocol::StreamFuture<'a, Result<(), StreamError>> {
            Box::pin(std::future::pending())
        }

        fn close(&self) -> protocol::StreamFuture<'_, Result<(), StreamError>> {
            Box::pin(async { Ok(()) })
        }
    }

    async fn recv(stream: &MemoryStream) -> Option<Bytes> {
        timeout(Duration::from_secs(1), stream.produce())
            .await
            .expect("timeout")
            .expect("stream error")
    }

    #[tokio::test]
    async fn test_viewer_set_insert_and_remove() {
        let set = ViewerSet::default();
        assert!(set.is_empty().await);

        let (a, _a_remote) = MemoryStream::pair();
        let (id, _rx) = set.insert(Arc::new(a)).await;
        assert_eq!(set.len().await, 1);
        assert_eq!(set.ids().await, vec![id.clone()]);

        assert!(set.remove(&id).await.is_some());
        assert!(set.remove(&id).await.is_none());
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_viewer() {
        let set = ViewerSet::default();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (viewer, _remote) = MemoryStream::pair();
            receivers.push(set.insert(Arc::new(viewer)).await.1);
        }

        let report = set.broadcast(Bytes::from_static(b"hello")).await;
        assert_eq!(report.delivered, 3);
        assert!(report.evicted.is_empty());

        for rx in receivers.iter_mut() {
            assert_eq!(rx.recv().await, Some(Bytes::from_static(b"hello")));
        }
        assert!(set.delivered().await.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn test_full_queue_evicts_slow_viewer() {
        let set = ViewerSet::new(2);
        let (slow, _slow_remote) = MemoryStream::pair();
        let (_slow_id, _slow_rx) = set.insert(Arc::new(slow)).await;
        let (fast, _fast_remote) = MemoryStream::pair();
        let (fast_id, mut fast_rx) = set.insert(Arc::new(fast)).await;

        for chunk in [&b"1"[..], b"2"] {
            set.broadcast(Bytes::copy_from_slice(chunk)).await;
            fast_rx.recv().await.unwrap();
        }

        let report = set.broadcast(Bytes::from_static(b"3")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].cause, EvictionCause::SlowConsumer);
        assert_eq!(set.ids().await, vec![fast_id]);
    }

    #[tokio::test]
    async fn test_closed_queue_is_evicted() {
        let set = ViewerSet::default();
        let (viewer, _remote) = MemoryStream::pair();
        let (_id, rx) = set.insert(Arc::new(viewer)).await;
        drop(rx);

        let report = set.broadcast(Bytes::from_static(b"x")).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.evicted[0].cause, EvictionCause::Disconnected);
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn test_writer_flushes_then_closes() {
        let (viewer, remote) = MemoryStream::pair();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Bytes::from_static(b"a")).await.unwrap();
        tx.send(Bytes::from_static(b"b")).await.unwrap();
        drop(tx);

        let outcome = run_writer("v".to_string(), Arc::new(viewer), rx).await;
        assert_eq!(outcome, WriterOutcome::Drained);

        assert_eq!(recv(&remote).await, Some(Bytes::from_static(b"a")));
        assert_eq!(recv(&remote).await, Some(Bytes::from_static(b"b")));
        assert_eq!(recv(&remote).await, None);
    }

    #[tokio::test]
    async fn test_writer_reports_failure() {
        let (viewer, remote) = MemoryStream::pair();
        remote.close().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Bytes::from_static(b"a")).await.unwrap();

        let outcome = run_writer("v".to_string(), Arc::new(viewer), rx).await;
        assert_eq!(outcome, WriterOutcome::Failed(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_mux_delivers_in_order_until_source_ends() {
        let (source, terminal) = MemoryStream::pair();
        let set = Arc::new(ViewerSet::default());

        let mut remotes = Vec::new();
        let mut writers = Vec::new();
        for _ in 0..2 {
            let (viewer, remote) = MemoryStream::pair();
            let viewer: Arc<dyn Stream> = Arc::new(viewer);
            let (id, rx) = set.insert(Arc::clone(&viewer)).await;
            writers.push(tokio::spawn(run_writer(id, viewer, rx)));
            remotes.push(remote);
        }

        let mux = BroadcastMux::new(Arc::new(source), Arc::clone(&set));
        let counter = mux.chunk_counter();
        let handle = tokio::spawn(mux.run());

        for chunk in [&b"a"[..], b"b", b"c"] {
            terminal.consume(chunk).await.unwrap();
        }
        terminal.close().await.unwrap();

        let outcome = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(outcome, MuxOutcome::SourceEnded);
        assert_eq!(counter.load(Ordering::Relaxed), 3);

        for remote in &remotes {
            for expected in [&b"a"[..], b"b", b"c"] {
                assert_eq!(recv(remote).await.as_deref(), Some(expected));
            }
        }
    }

    #[tokio::test]
    async fn test_mux_survives_stalled_viewer() {
        let (source, terminal) = MemoryStream::pair();
        let set = Arc::new(ViewerSet::new(1));

        let stalled: Arc<dyn Stream> = Arc::new(StalledStream);
        let (stalled_id, stalled_rx) = set.insert(Arc::clone(&stalled)).await;
        tokio::spawn(run_writer(stalled_id.clone(), stalled, stalled_rx));

        let (viewer, remote) = MemoryStream::pair();
        let viewer: Arc<dyn Stream> = Arc::new(viewer);
        let (id, rx) = set.insert(Arc::clone(&viewer)).await;
        tokio::spawn(run_writer(id, viewer, rx));

        tokio::spawn(BroadcastMux::new(Arc::new(source), Arc::clone(&set)).run());

        for i in 0..5u8 {
            terminal.consume(&[i]).await.unwrap();
            assert_eq!(recv(&remote).await.as_deref(), Some(&[i][..]));
        }

        assert!(!set.ids().await.contains(&stalled_id));
    }

    #[tokio::test]
    async fn test_mux_survives_websocket_viewer_that_stops_reading() {
        use crate::network::WsViewer;
        use tokio_tungstenite::tungstenite::protocol::Role;
        use tokio_tungstenite::WebSocketStream;

        let (source, terminal) = MemoryStream::pair();
        let set = Arc::new(ViewerSet::new(4));

        // The client end is kept alive but never read.
        let (server, _client) = tokio::io::duplex(1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let stuck = Arc::new(WsViewer::new("stuck", server));
        let (stuck_id, stuck_rx) = set.insert(Arc::clone(&stuck) as Arc<dyn Stream>).await;
        let stuck_writer = tokio::spawn(run_writer(
            stuck_id.clone(),
            Arc::clone(&stuck) as Arc<dyn Stream>,
            stuck_rx,
        ));

        let (viewer, remote) = MemoryStream::pair();
        let viewer: Arc<dyn Stream> = Arc::new(viewer);
        let (id, rx) = set.insert(Arc::clone(&viewer)).await;
        tokio::spawn(run_writer(id, viewer, rx));

        tokio::spawn(BroadcastMux::new(Arc::new(source), Arc::clone(&set)).run());

        for i in 0..64u8 {
            let chunk = vec![i; 512];
            terminal.consume(&chunk).await.unwrap();
            assert_eq!(recv(&remote).await.as_deref(), Some(&chunk[..]), "chunk {i}");
        }

        assert!(!set.ids().await.contains(&stuck_id));
        assert_eq!(set.len().await, 1);
        let outcome = timeout(Duration::from_secs(3), stuck_writer)
            .await
            .expect("stuck writer never released")
            .unwrap();
        assert_eq!(outcome, WriterOutcome::Failed(StreamError::Closed));
        assert!(stuck.is_closed());
    }
}
