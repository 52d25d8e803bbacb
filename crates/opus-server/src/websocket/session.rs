//! Per-connection session state and its bounded outbound queue.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::EnqueueError;

/// Server-assigned session identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh, time-ordered id of the form `client_{uuid}`.
    pub fn generate() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Producer half of a session's outbound queue.
///
/// Pushes never block: a full queue drops the frame and bumps [`dropped`](Self::dropped).
/// Once [`close`](Self::close) is called every further push fails and the
/// receiver yields `None`, even if frames are still buffered.
#[derive(Debug)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    capacity: usize,
    dropped: AtomicU64,
}

/// Consumer half, owned by the write pump.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Arc<str>>,
    closed: CancellationToken,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let queue = Self {
            tx,
            closed: closed.clone(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        };
        (queue, OutboundReceiver { rx, closed })
    }

    /// Enqueue an already-serialized frame without waiting.
    pub fn push(&self, frame: Arc<str>) -> Result<(), EnqueueError> {
        if self.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the queue is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum number of buffered frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl OutboundReceiver {
    /// Next frame, or `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    outbound: OutboundQueue,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
}

impl Session {
    /// New session with a generated id.
    pub fn new(capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        Self::with_id(SessionId::generate(), capacity)
    }

    /// New session with a caller-chosen id.
    pub fn with_id(id: SessionId, capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let (outbound, rx) = OutboundQueue::new(capacity);
        let now = Instant::now();
        let session = Arc::new(Self {
            id,
            outbound,
            connected_at: now,
            last_activity: Mutex::new(now),
        });
        (session, rx)
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Outbound queue.
    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Record inbound activity from the client.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the client was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
