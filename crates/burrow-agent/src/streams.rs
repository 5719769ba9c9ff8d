use burrow_proto::StreamId;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-stream queue of bytes waiting to be written locally
pub const STREAM_QUEUE_CAPACITY: usize = 64;

/// Closed ids remembered per session; the oldest are forgotten first
pub const MAX_TOMBSTONES: usize = 4096;

/// Stream table errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream already open: {0}")]
    AlreadyOpen(StreamId),

    #[error("Stream already closed in this session: {0}")]
    AlreadyClosed(StreamId),
}

/// Lifecycle of a registered stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the local connect to finish
    Connecting,
    /// Local connection established, relaying bytes
    Open,
}

/// Table entry for one stream
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Local port the stream targets
    pub port: u16,
    pub state: StreamState,
    /// Feeds bytes from the proxy to the stream worker
    pub tx: mpsc::Sender<Bytes>,
    /// Cancelled when the stream leaves the table
    pub closed: CancellationToken,
    pub opened_at: Instant,
}

/// What a worker receives for a freshly registered stream
#[derive(Debug)]
pub struct StreamHandle {
    pub inbound: mpsc::Receiver<Bytes>,
    pub closed: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    open: HashMap<StreamId, StreamEntry>,
    /// Ids closed during this session; frames for them are ignored
    closed: HashSet<StreamId>,
    /// Close order of `closed`, oldest first
    closed_order: VecDeque<StreamId>,
}

impl Inner {
    fn tombstone(&mut self, stream_id: StreamId) {
        if !self.closed.insert(stream_id) {
            return;
        }
        self.closed_order.push_back(stream_id);

        while self.closed_order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }
}

/// Registry of the streams multiplexed over one proxy connection
///
/// A table lives exactly as long as one connection: the supervisor builds a
/// fresh one for every session, so ids never leak across reconnects.
#[derive(Clone, Debug, Default)]
pub struct StreamTable {
    inner: Arc<Mutex<Inner>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The map stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream requested by a NEW frame
    ///
    /// Returns the receiving end of the stream's queue and its close signal;
    /// the worker owns both.
    pub fn register(&self, stream_id: StreamId, port: u16) -> Result<StreamHandle, StreamError> {
        let mut inner = self.lock();

        if inner.open.contains_key(&stream_id) {
            return Err(StreamError::AlreadyOpen(stream_id));
        }
        if inner.closed.contains(&stream_id) {
            return Err(StreamError::AlreadyClosed(stream_id));
        }

        let (tx, inbound) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        let closed = CancellationToken::new();
        inner.open.insert(
            stream_id,
            StreamEntry {
                port,
                state: StreamState::Connecting,
                tx,
                closed: closed.clone(),
                opened_at: Instant::now(),
            },
        );

        tracing::debug!(
            stream_id = stream_id,
            port = port,
            active_streams = inner.open.len(),
            "Stream registered"
        );

        Ok(StreamHandle { inbound, closed })
    }

    /// Mark a stream as connected to its local service
    ///
    /// Returns false if the stream was closed meanwhile.
    pub fn mark_open(&self, stream_id: StreamId) -> bool {
        let mut inner = self.lock();
        match inner.open.get_mut(&stream_id) {
            Some(entry) => {
                entry.state = StreamState::Open;
                true
            }
            None => false,
        }
    }

    /// Look up an open or connecting stream
    pub fn get(&self, stream_id: StreamId) -> Option<StreamEntry> {
        self.lock().open.get(&stream_id).cloned()
    }

    /// Remove a stream and remember its id as closed
    ///
    /// Idempotent: only the first caller gets the entry back, every later
    /// call returns `None`.
    pub fn remove(&self, stream_id: StreamId) -> Option<StreamEntry> {
        let mut inner = self.lock();
        let entry = inner.open.remove(&stream_id)?;
        inner.tombstone(stream_id);
        entry.closed.cancel();

        tracing::debug!(
            stream_id = stream_id,
            port = entry.port,
            duration_ms = entry.opened_at.elapsed().as_millis() as u64,
            active_streams = inner.open.len(),
            "Stream removed"
        );

        Some(entry)
    }

    /// Whether CLOSE has already been seen for this id in this session
    pub fn is_closed(&self, stream_id: StreamId) -> bool {
        self.lock().closed.contains(&stream_id)
    }

    /// Number of open or connecting streams
    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every stream (used when the proxy connection goes away)
    ///
    /// Each worker is signalled through its `closed` token and ends without a
    /// CLOSE frame.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.open.len();
        let drained: Vec<(StreamId, StreamEntry)> = inner.open.drain().collect();
        for (stream_id, entry) in drained {
            inner.tombstone(stream_id);
            entry.closed.cancel();
        }

        tracing::debug!(cleared_streams = count, "All streams cleared");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_get_remove() {
        let table = StreamTable::new();

        let mut handle = table.register(1, 22).unwrap();
        assert_eq!(table.len(), 1);

        let entry = table.get(1).unwrap();
        assert_eq!(entry.port, 22);
        assert_eq!(entry.state, StreamState::Connecting);

        entry.tx.send(Bytes::from("ls\n")).await.unwrap();
        assert_eq!(handle.inbound.recv().await.unwrap(), Bytes::from("ls\n"));

        assert!(table.mark_open(1));
        assert_eq!(table.get(1).unwrap().state, StreamState::Open);

        assert!(table.remove(1).is_some());
        assert!(table.get(1).is_none());
        assert!(table.is_empty());
        assert!(handle.closed.is_cancelled());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = StreamTable::new();
        let _handle = table.register(7, 80).unwrap();

        assert!(table.remove(7).is_some());
        assert!(table.remove(7).is_none());
        assert!(table.remove(99).is_none());
        assert!(!table.mark_open(7));
    }

    #[test]
    fn test_duplicate_and_closed_ids_rejected() {
        let table = StreamTable::new();
        let _handle = table.register(3, 80).unwrap();

        assert_eq!(table.register(3, 80).unwrap_err(), StreamError::AlreadyOpen(3));

        table.remove(3);
        assert!(table.is_closed(3));
        assert_eq!(
            table.register(3, 80).unwrap_err(),
            StreamError::AlreadyClosed(3)
        );
    }

    #[tokio::test]
    async fn test_clear_closes_worker_queues() {
        let table = StreamTable::new();
        let mut first = table.register(1, 22).unwrap();
        let mut second = table.register(2, 80).unwrap();

        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
        assert!(table.is_closed(1));

        assert!(first.closed.is_cancelled());
        assert!(second.closed.is_cancelled());
        assert!(first.inbound.recv().await.is_none());
        assert!(second.inbound.recv().await.is_none());
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let table = StreamTable::new();
        let total = MAX_TOMBSTONES as StreamId + 10;

        for stream_id in 0..total {
            let _handle = table.register(stream_id, 80).unwrap();
            table.remove(stream_id);
        }

        assert_eq!(table.lock().closed.len(), MAX_TOMBSTONES);
        assert_eq!(table.lock().closed_order.len(), MAX_TOMBSTONES);

        // Oldest ids were forgotten, recent ones are still refused
        assert!(!table.is_closed(0));
        assert!(table.register(0, 80).is_ok());
        assert!(table.is_closed(total - 1));
        assert_eq!(
            table.register(total - 1, 80).unwrap_err(),
            StreamError::AlreadyClosed(total - 1)
        );
    }

    #[test]
    fn test_concurrent_remove_single_winner() {
        let table = StreamTable::new();
        let _handle = table.register(5, 3389).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || table.remove(5).is_some())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }
}
