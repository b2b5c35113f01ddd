use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::control::{parse_inbound, InboundFrame, OutboundFrame, ResizeParse, TerminalInput};
use super::process::{PtyMaster, PtyProcess};
use crate::config::TerminalConfig;
use crate::mux::SessionManager;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SPAWN_FAILED: u16 = 1011;
pub const CLOSE_NOT_FOUND: u16 = 4404;
pub const CLOSE_BUSY: u16 = 4409;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Validating,
    Spawning,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    PeerClosed,
    PtyExited,
    StreamError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    NotFound,
    Busy,
    LookupFailed,
    SpawnFailed,
    Finished { pid: Option<u32>, reason: EndReason },
}

impl BridgeOutcome {
    /// Last state the bridge was in before it closed.
    pub fn ended_in(&self) -> BridgeState {
        match self {
            BridgeOutcome::NotFound | BridgeOutcome::Busy | BridgeOutcome::LookupFailed => {
                BridgeState::Validating
            }
            BridgeOutcome::SpawnFailed => BridgeState::Spawning,
            BridgeOutcome::Finished { .. } => BridgeState::Closing,
        }
    }
}

/// Holds a session's attachment slot until dropped.
struct AttachGuard {
    attached: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl AttachGuard {
    fn acquire(attached: &Arc<Mutex<HashSet<String>>>, session_id: &str) -> Option<Self> {
        let inserted = attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string());
        inserted.then(|| Self {
            attached: attached.clone(),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
    }
}

/// Connects one client connection to one tmux session through a fresh PTY
/// running `tmux attach-session`.
pub struct PtyBridge {
    sessions: Arc<SessionManager>,
    terminal: TerminalConfig,
    attached: Arc<Mutex<HashSet<String>>>,
    attach_command: Option<Vec<String>>,
}

impl PtyBridge {
    pub fn new(sessions: Arc<SessionManager>, terminal: TerminalConfig) -> Self {
        Self {
            sessions,
            terminal,
            attached: Arc::new(Mutex::new(HashSet::new())),
            attach_command: None,
        }
    }

    /// Run `argv` on the PTY instead of the tmux attach command.
    #[cfg(test)]
    pub fn with_attach_command(mut self, argv: Vec<String>) -> Self {
        self.attach_command = Some(argv);
        self
    }

    #[cfg(test)]
    pub fn is_attached(&self, session_id: &str) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    pub async fn run<I, O>(&self, session_id: &str, mut inbound: I, mut outbound: O) -> BridgeOutcome
    where
        I: Stream<Item = InboundFrame> + Unpin + Send,
        O: Sink<OutboundFrame> + Unpin + Send + 'static,
        O::Error: std::fmt::Display + Send,
    {
        let mut state = Transition::new(session_id);

        match self.sessions.exists(session_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(session = %session_id, "Attach to unknown session");
                close_with(&mut outbound, CLOSE_NOT_FOUND, "session not found").await;
                state.to(BridgeState::Closed);
                return BridgeOutcome::NotFound;
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Session lookup failed");
                close_with(&mut outbound, CLOSE_SPAWN_FAILED, "session lookup failed").await;
                state.to(BridgeState::Closed);
                return BridgeOutcome::LookupFailed;
            }
        }

        let Some(guard) = AttachGuard::acquire(&self.attached, session_id) else {
            tracing::info!(session = %session_id, "Session already attached");
            close_with(&mut outbound, CLOSE_BUSY, "session already attached").await;
            state.to(BridgeState::Closed);
            return BridgeOutcome::Busy;
        };

        state.to(BridgeState::Spawning);
        let argv = self
            .attach_command
            .clone()
            .unwrap_or_else(|| self.sessions.attach_argv(session_id));
        let mut process = match PtyProcess::spawn(
            &argv,
            self.terminal.cols,
            self.terminal.rows,
            &self.terminal.env_overrides(),
        ) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "Failed to spawn attach process");
                close_with(&mut outbound, CLOSE_SPAWN_FAILED, "spawn failed").await;
                state.to(BridgeState::Closed);
                return BridgeOutcome::SpawnFailed;
            }
        };
        let pid = process.pid();

        state.to(BridgeState::Streaming);
        tracing::info!(session = %session_id, pid = ?pid, "Terminal attached");

        let token = CancellationToken::new();
        let master = process.master();
        let output_task = tokio::spawn(pump_output(master.clone(), outbound, token.clone()));
        let input_reason = pump_input(&master, &mut inbound, &token, session_id).await;

        state.to(BridgeState::Closing);
        token.cancel();
        let output_reason = match output_task.await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "PTY output task failed");
                Some(EndReason::StreamError)
            }
        };
        process.terminate().await;
        drop(guard);

        let reason = output_reason
            .filter(|r| *r == EndReason::PtyExited)
            .or(input_reason)
            .or(output_reason)
            .unwrap_or(EndReason::PeerClosed);
        state.to(BridgeState::Closed);
        tracing::info!(session = %session_id, pid = ?pid, reason = ?reason, "Terminal detached");

        BridgeOutcome::Finished { pid, reason }
    }
}

/// Logs state changes of one bridge run.
struct Transition<'a> {
    session_id: &'a str,
    current: BridgeState,
}

impl<'a> Transition<'a> {
    fn new(session_id: &'a str) -> Self {
        Self {
            session_id,
            current: BridgeState::Validating,
        }
    }

    fn to(&mut self, next: BridgeState) {
        tracing::debug!(session = %self.session_id, from = ?self.current, to = ?next, "Bridge state");
        self.current = next;
    }
}

async fn close_with<O>(outbound: &mut O, code: u16, reason: &str)
where
    O: Sink<OutboundFrame> + Unpin,
    O::Error: std::fmt::Display,
{
    let frame = OutboundFrame::Close {
        code,
        reason: reason.to_string(),
    };
    if let Err(e) = outbound.send(frame).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
    let _ = outbound.close().await;
}

/// PTY -> connection. `None` when cancelled from the input side.
async fn pump_output<O>(
    master: Arc<PtyMaster>,
    mut outbound: O,
    token: CancellationToken,
) -> Option<EndReason>
where
    O: Sink<OutboundFrame> + Unpin + Send,
    O::Error: std::fmt::Display + Send,
{
    // Ending for any reason stops the input loop too
    let _cancel_on_exit = token.clone().drop_guard();
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = loop {
        let read = tokio::select! {
            _ = token.cancelled() => break None,
            r = master.read(&mut buf) => r,
        };
        let frame = match read {
            Ok(0) => {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    let _ = outbound.send(OutboundFrame::Text(tail)).await;
                }
                close_with(&mut outbound, CLOSE_NORMAL, "session ended").await;
                break Some(EndReason::PtyExited);
            }
            Ok(n) => decoder.decode(&buf[..n]),
            Err(e) => {
                tracing::warn!(error = %e, "PTY read failed");
                break Some(EndReason::StreamError);
            }
        };
        if frame.is_empty() {
            continue;
        }
        let sent = tokio::select! {
            _ = token.cancelled() => break None,
            r = outbound.send(OutboundFrame::Text(frame)) => r,
        };
        if let Err(e) = sent {
            tracing::debug!(error = %e, "Connection send failed");
            break Some(EndReason::StreamError);
        }
    };

    let _ = outbound.close().await;
    reason
}

/// Connection -> PTY. `None` when cancelled from the output side.
async fn pump_input<I>(
    master: &PtyMaster,
    inbound: &mut I,
    token: &CancellationToken,
    session_id: &str,
) -> Option<EndReason>
where
    I: Stream<Item = InboundFrame> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return None,
            f = inbound.next() => f,
        };
        let Some((input, parsed)) = frame.and_then(parse_inbound) else {
            return Some(EndReason::PeerClosed);
        };

        match input {
            TerminalInput::Resize { cols, rows } => {
                match master.resize(cols, rows) {
                    Ok(()) => {
                        tracing::debug!(session = %session_id, size = ?master.size().ok(), "PTY resized")
                    }
                    Err(e) => {
                        tracing::warn!(session = %session_id, cols, rows, error = %e, "PTY resize failed")
                    }
                }
            }
            TerminalInput::Data(data) => {
                if parsed == ResizeParse::Malformed {
                    tracing::debug!(session = %session_id, "Malformed resize message forwarded as input");
                }
                let written = tokio::select! {
                    _ = token.cancelled() => return None,
                    r = master.write_all(&data) => r,
                };
                if let Err(e) = written {
                    tracing::warn!(session = %session_id, error = %e, "PTY write failed");
                    return Some(EndReason::StreamError);
                }
            }
        }
    }
}

/// Incremental UTF-8 decoding; an incomplete trailing sequence is held
/// back until the next chunk. Invalid bytes become U+FFFD.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }
        let keep = rest.to_vec();
        self.pending = keep;
        out
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
