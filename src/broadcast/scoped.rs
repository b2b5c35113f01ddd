use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::handle::{ConnectionHandle, ConnectionId, Delivery, Payload};

#[derive(Default)]
struct ScopeTable {
    /// scope -> handles, ordered by registration
    forward: HashMap<String, BTreeMap<ConnectionId, ConnectionHandle>>,
    /// handle -> its single scope
    reverse: HashMap<ConnectionId, String>,
}

impl ScopeTable {
    fn remove(&mut self, id: ConnectionId) -> Option<String> {
        let scope = self.reverse.remove(&id)?;
        if let Some(set) = self.forward.get_mut(&scope) {
            set.remove(&id);
            if set.is_empty() {
                self.forward.remove(&scope);
            }
        }
        Some(scope)
    }
}

/// Fan-out partitioned by scope key (one scope per subject).
#[derive(Default)]
pub struct ScopedRegistry {
    table: Mutex<ScopeTable>,
}

impl ScopedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register under `scope`. A handle already registered elsewhere moves.
    pub fn register(&self, scope: &str, handle: ConnectionHandle) {
        let mut table = self.lock();
        let id = handle.id();
        table.remove(id);
        table
            .forward
            .entry(scope.to_string())
            .or_default()
            .insert(id, handle);
        table.reverse.insert(id, scope.to_string());
    }

    /// Remove a handle; its scope is found through the reverse map.
    pub fn unregister(&self, id: ConnectionId) -> Option<String> {
        self.lock().remove(id)
    }

    #[cfg(test)]
    pub fn scope_of(&self, id: ConnectionId) -> Option<String> {
        self.lock().reverse.get(&id).cloned()
    }

    pub fn scope_len(&self, scope: &str) -> usize {
        self.lock().forward.get(scope).map_or(0, |s| s.len())
    }

    /// Deliver only to handles under `scope`. Unknown or empty scope is a no-op.
    pub fn broadcast(&self, scope: &str, payload: Payload) -> usize {
        let snapshot: Vec<ConnectionHandle> = match self.lock().forward.get(scope) {
            Some(set) => set.values().cloned().collect(),
            None => return 0,
        };

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
            let mut table = self.lock();
            for id in dead {
                table.remove(id);
                tracing::warn!(connection = id, scope = %scope, "Evicted dead scoped subscriber");
            }
        }

        delivered
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        let table = self.lock();
        let forward_total: usize = table.forward.values().map(|s| s.len()).sum();
        assert_eq!(forward_total, table.reverse.len());
        for (id, scope) in &table.reverse {
            let holders = table
                .forward
                .iter()
                .filter(|(_, set)| set.contains_key(id))
                .count();
            assert_eq!(holders, 1);
            assert!(table.forward[scope].contains_key(id));
        }
        assert!(table.forward.values().all(|s| !s.is_empty()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broadcast_only_to_matching_scope() {
        let reg = ScopedRegistry::new();
        let (a, mut rx_a) = ConnectionHandle::new();
        let (b, mut rx_b) = ConnectionHandle::new();
        let (c, mut rx_c) = ConnectionHandle::new();
        reg.register("u1", a);
        reg.register("u1", b);
        reg.register("u2", c);

        assert_eq!(reg.broadcast("u1", Arc::from("hi")), 2);
        assert_eq!(&*rx_a.recv().await.unwrap(), "hi");
        assert_eq!(&*rx_b.recv().await.unwrap(), "hi");
        assert!(rx_c.try_recv().is_err());
        reg.check_invariant();
    }

    #[test]
    fn test_absent_scope_is_noop() {
        let reg = ScopedRegistry::new();
        assert_eq!(reg.broadcast("nobody", Arc::from("x")), 0);
        assert_eq!(reg.broadcast("", Arc::from("x")), 0);
    }

    #[test]
    fn test_unregister_uses_reverse_map() {
        let reg = ScopedRegistry::new();
        let (a, _rx) = ConnectionHandle::new();
        let id = a.id();
        reg.register("u1", a);
        assert_eq!(reg.unregister(id).as_deref(), Some("u1"));
        assert_eq!(reg.unregister(id), None);
        assert_eq!(reg.scope_len("u1"), 0);
        reg.check_invariant();
    }

    #[test]
    fn test_reregister_moves_scope() {
        let reg = ScopedRegistry::new();
        let (a, _rx) = ConnectionHandle::new();
        let id = a.id();
        reg.register("u1", a.clone());
        reg.register("u2", a);
        assert_eq!(reg.scope_of(id).as_deref(), Some("u2"));
        assert_eq!(reg.scope_len("u1"), 0);
        assert_eq!(reg.scope_len("u2"), 1);
        reg.check_invariant();
    }

    #[test]
    fn test_dead_handle_evicted() {
        let reg = ScopedRegistry::new();
        let (a, rx_a) = ConnectionHandle::new();
        let (b, _rx_b) = ConnectionHandle::new();
        let dead_id = a.id();
        reg.register("u1", a);
        reg.register("u1", b);
        drop(rx_a);

        assert_eq!(reg.broadcast("u1", Arc::from("x")), 1);
        assert_eq!(reg.scope_of(dead_id), None);
        assert_eq!(reg.scope_len("u1"), 1);
        reg.check_invariant();
    }

    #[tokio::test]
    async fn test_concurrent_use_keeps_invariant() {
        let reg = Arc::new(ScopedRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..24 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                let scope = format!("u{}", i % 3);
                let (h, _rx) = ConnectionHandle::new();
                let id = h.id();
                reg.register(&scope, h);
                reg.broadcast(&scope, Arc::from("x"));
                if i % 2 == 0 {
                    reg.unregister(id);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        reg.check_invariant();
    }
}
