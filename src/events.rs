use serde::{Deserialize, Serialize};

use crate::status::StatusEvent;

/// Messages pushed over the event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    SessionCreated {
        session_id: String,
        working_directory: String,
    },
    SessionDestroyed {
        session_id: String,
    },
    Status(StatusEvent),
    Notification {
        scope: String,
        payload: serde_json::Value,
    },
}
