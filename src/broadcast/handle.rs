use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Unique identifier for a registered connection.
pub type ConnectionId = u64;

/// A serialized message shared by every recipient of one broadcast.
pub type Payload = Arc<str>;

/// Default channel capacity between a registry and a connection's writer task.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Result of handing one payload to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection's queue is full; this payload is lost for it.
    Dropped,
    /// The connection's writer is gone; the handle should be evicted.
    Dead,
}

/// Registry-side handle to a live connection.
///
/// Sends never block: the connection's own writer task drains the receiver
/// and does the socket I/O.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Payload>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::Receiver<Payload>) {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn deliver(&self, payload: &Payload) -> Delivery {
        match self.tx.try_send(payload.clone()) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection = self.id, "Connection lagging, dropped payload");
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Dead,
        }
    }
}
