use std::collections::HashMap;
use std::sync::Mutex;

use super::handle::{ConnectionHandle, ConnectionId, Delivery, Payload};

/// Fan-out to every registered connection.
#[derive(Default)]
pub struct GlobalRegistry {
    handles: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.lock().insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Deliver to a snapshot of current handles, then evict the dead ones.
    /// Returns how many connections accepted the payload.
    pub fn broadcast(&self, payload: Payload) -> usize {
        let snapshot: Vec<ConnectionHandle> = self.lock().values().cloned().collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for handle in &snapshot {
            match handle.deliver(&payload) {
                Delivery::Sent => delivered += 1,
                Delivery::Dropped => {}
                Delivery::Dead => dead.push(handle.id()),
            }
        }

        if !dead.is_empty() {
            let mut handles = self.lock();
            for id in dead {
                handles.remove(&id);
                tracing::warn!(connection = id, "Evicted dead event subscriber");
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let reg = GlobalRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (h, rx) = ConnectionHandle::new();
            reg.register(h);
            receivers.push(rx);
        }

        assert_eq!(reg.broadcast(Arc::from("hello")), 3);
        for rx in &mut receivers {
            assert_eq!(&*rx.recv().await.unwrap(), "hello");
        }
    }

    #[tokio::test]
    async fn test_failing_handle_is_evicted_others_still_receive() {
        let reg = GlobalRegistry::new();
        let (good_a, mut rx_a) = ConnectionHandle::new();
        let (bad, rx_bad) = ConnectionHandle::new();
        let (good_b, mut rx_b) = ConnectionHandle::new();
        let bad_id = bad.id();
        reg.register(good_a);
        reg.register(bad);
        reg.register(good_b);
        drop(rx_bad);

        assert_eq!(reg.broadcast(Arc::from("event")), 2);
        assert_eq!(&*rx_a.recv().await.unwrap(), "event");
        assert_eq!(&*rx_b.recv().await.unwrap(), "event");
        assert!(!reg.unregister(bad_id));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_unregister() {
        let reg = GlobalRegistry::new();
        let (h, _rx) = ConnectionHandle::new();
        let id = h.id();
        reg.register(h);
        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
        assert_eq!(reg.broadcast(Arc::from("x")), 0);
    }

    #[tokio::test]
    async fn test_concurrent_register_and_broadcast() {
        let reg = Arc::new(GlobalRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                let (h, rx) = ConnectionHandle::new();
                let id = h.id();
                reg.register(h);
                reg.broadcast(Arc::from("tick"));
                reg.unregister(id);
                drop(rx);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(reg.len(), 0);
    }
}
