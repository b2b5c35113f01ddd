//! Frames on the terminal-attach stream and the embedded resize message.
//!
//! A text frame is a resize request only if it decodes as a JSON object
//! with `type == "resize"` and integer `cols`/`rows`. Every other text frame
//! and every binary frame is terminal input, byte for byte.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A frame received from the client, independent of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// What the bridge does with an inbound data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    Resize { cols: u16, rows: u16 },
    Data(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub cols: u16,
    pub rows: u16,
}

impl ResizeMessage {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            kind: "resize".to_string(),
            cols,
            rows,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Outcome of testing a text frame against the resize grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeParse {
    Resize { cols: u16, rows: u16 },
    /// Not a resize message at all
    NotControl,
    /// Resembles a resize message but does not fit the grammar
    Malformed,
}

pub fn parse_resize(text: &str) -> ResizeParse {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') && trimmed.contains("\"resize\"") {
                return ResizeParse::Malformed;
            }
            return ResizeParse::NotControl;
        }
    };

    if value.get("type").and_then(|t| t.as_str()) != Some("resize") {
        return ResizeParse::NotControl;
    }

    match serde_json::from_value::<ResizeMessage>(value) {
        Ok(msg) => ResizeParse::Resize {
            cols: msg.cols,
            rows: msg.rows,
        },
        Err(_) => ResizeParse::Malformed,
    }
}

/// Interpret an inbound frame. `None` means the peer is closing.
pub fn parse_inbound(frame: InboundFrame) -> Option<(TerminalInput, ResizeParse)> {
    match frame {
        InboundFrame::Close => None,
        InboundFrame::Binary(data) => Some((TerminalInput::Data(data), ResizeParse::NotControl)),
        InboundFrame::Text(text) => {
            let parsed = parse_resize(&text);
            let input = match parsed {
                ResizeParse::Resize { cols, rows } => TerminalInput::Resize { cols, rows },
                ResizeParse::NotControl | ResizeParse::Malformed => {
                    TerminalInput::Data(Bytes::from(text))
                }
            };
            Some((input, parsed))
        }
    }
}
