//! Best-effort fan-out of events to connected observers.
//!
//! Two independent lock domains: the global registry reaches every event
//! feed connection, the scoped registry only the connections of one subject.
//! Neither does I/O; each registered connection owns a writer task.

pub mod global;
pub mod handle;
pub mod scoped;

pub use global::GlobalRegistry;
pub use handle::{ConnectionHandle, ConnectionId};
pub use scoped::ScopedRegistry;

use std::sync::Arc;

use crate::events::Event;

#[derive(Default)]
pub struct Broadcaster {
    pub global: GlobalRegistry,
    pub scoped: ScopedRegistry,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            global: GlobalRegistry::new(),
            scoped: ScopedRegistry::new(),
        }
    }

    /// Serialize once and deliver to every event feed.
    pub fn publish(&self, event: &Event) -> usize {
        match serde_json::to_string(event) {
            Ok(json) => self.global.broadcast(Arc::from(json)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize event");
                0
            }
        }
    }

    /// Deliver a caller-supplied payload to one scope.
    pub fn notify(&self, scope: &str, payload: serde_json::Value) -> usize {
        let event = Event::Notification {
            scope: scope.to_string(),
            payload,
        };
        match serde_json::to_string(&event) {
            Ok(json) => self.scoped.broadcast(scope, Arc::from(json)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize notification");
                0
            }
        }
    }
}
