//! Executes controller actions against a real terminal and server.

use anyhow::Result;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::api::ApiClient;
use super::backoff::Backoff;
use super::controller::{Action, Controller, ControllerState, Event, Generation};
use super::renderer::{terminal_size, RawModeGuard, Renderer};
use crate::config::ClientConfig;
use crate::pty::bridge::CLOSE_NOT_FOUND;
use crate::pty::ResizeMessage;

/// The escape character: Ctrl+] (0x1D)
const ESCAPE_CHAR: u8 = 0x1D;

/// What the driver hands to the live connection task.
#[derive(Debug)]
enum Outgoing {
    Resize { cols: u16, rows: u16 },
    Input(Bytes),
}

/// One connection attempt, owned until torn down.
struct Connection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Connection {
    /// Cancel and let the task send its close frame.
    fn close(self) {
        self.cancel.cancel();
        drop(self.task);
    }
}

pub struct Driver {
    api: ApiClient,
    controller: Controller,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    connection: Option<Connection>,
    timer: Option<JoinHandle<()>>,
    renderer: Renderer<tokio::io::Stdout>,
}

impl Driver {
    pub fn new(api: ApiClient, config: &ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            api,
            controller: Controller::new(Backoff::from_config(config), terminal_size()),
            events_tx,
            events_rx,
            connection: None,
            timer: None,
            renderer: Renderer::stdout(),
        }
    }

    /// Attach the local terminal to `session_id` until detached.
    pub async fn run(mut self, session_id: &str) -> Result<()> {
        let raw = RawModeGuard::enable()?;
        let stdin_task = tokio::spawn(read_stdin(self.events_tx.clone()));
        let winch_task = tokio::spawn(watch_resize(self.events_tx.clone()));

        let mut pending = self.controller.handle(Event::SwitchTo(session_id.to_string()));
        let result = 'attach: loop {
            for action in pending.drain(..) {
                if let Err(e) = self.execute(action).await {
                    break 'attach Err(e);
                }
            }
            if self.controller.state() == ControllerState::Detached {
                break Ok(());
            }
            let Some(event) = self.events_rx.recv().await else {
                break Ok(());
            };
            pending = self.controller.handle(event);
        };

        stdin_task.abort();
        winch_task.abort();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(conn) = self.connection.take() {
            conn.close();
        }
        drop(raw);
        eprintln!("[detached]");
        result
    }

    async fn execute(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Connect {
                session_id,
                generation,
            } => {
                let url = self
                    .api
                    .ws_url(&format!("/ws/terminal/{}", session_id))?;
                tracing::debug!(
                    session = %session_id,
                    generation,
                    current = ?self.controller.session_id(),
                    latest = self.controller.generation(),
                    "Connecting"
                );
                let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
                let cancel = CancellationToken::new();
                let task = tokio::spawn(run_connection(
                    url.to_string(),
                    generation,
                    outgoing_rx,
                    self.events_tx.clone(),
                    cancel.clone(),
                ));
                if let Some(old) = self.connection.replace(Connection {
                    outgoing,
                    cancel,
                    task,
                }) {
                    old.close();
                }
            }
            Action::CloseConnection => {
                if let Some(conn) = self.connection.take() {
                    conn.close();
                }
            }
            Action::DisposeRenderer => self.renderer.dispose().await?,
            Action::CancelTimer => {
                if let Some(timer) = self.timer.take() {
                    timer.abort();
                }
            }
            Action::ScheduleReconnect { generation, delay } => {
                if let Some(conn) = self.connection.take() {
                    conn.close();
                }
                let tx = self.events_tx.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::TimerFired(generation));
                });
                if let Some(old) = self.timer.replace(timer) {
                    old.abort();
                }
            }
            Action::SendResize { cols, rows } => self.send(Outgoing::Resize { cols, rows }),
            Action::SendInput(data) => self.send(Outgoing::Input(data)),
            Action::Render(data) => self.renderer.render(&data).await?,
            Action::Notice(text) => self.renderer.notice(&text).await?,
        }
        Ok(())
    }

    fn send(&self, msg: Outgoing) {
        if let Some(conn) = &self.connection {
            let _ = conn.outgoing.send(msg);
        }
    }
}

/// Connect, report the outcome, then pump frames until closed or cancelled.
async fn run_connection(
    url: String,
    generation: Generation,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        r = connect_async(url.as_str()) => r,
    };
    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::debug!(error = %e, generation, "Connect failed");
            let _ = events.send(Event::ConnectFailed(generation));
            return;
        }
    };
    let _ = events.send(Event::Opened(generation));

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            msg = outgoing.recv() => {
                let Some(msg) = msg else { return };
                let frame = match msg {
                    Outgoing::Resize { cols, rows } => {
                        match ResizeMessage::new(cols, rows).to_json() {
                            Ok(json) => Message::Text(json.into()),
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to encode resize");
                                continue;
                            }
                        }
                    }
                    // Binary so typed input is never read as a control message
                    Outgoing::Input(data) => Message::Binary(data),
                };
                if sink.send(frame).await.is_err() {
                    let _ = events.send(Event::Closed(generation));
                    return;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let data = Bytes::copy_from_slice(text.as_str().as_bytes());
                        let _ = events.send(Event::Output { generation, data });
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = events.send(Event::Output { generation, data });
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let event = match frame {
                            Some(f) if f.code == CloseCode::from(CLOSE_NOT_FOUND) => Event::Rejected {
                                generation,
                                reason: f.reason.as_str().to_string(),
                            },
                            _ => Event::Closed(generation),
                        };
                        let _ = events.send(event);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, generation, "Connection error");
                        let _ = events.send(Event::Closed(generation));
                        return;
                    }
                    None => {
                        let _ = events.send(Event::Closed(generation));
                        return;
                    }
                }
            }
        }
    }
}

/// stdin -> Input events; Ctrl+] or EOF detaches.
async fn read_stdin(events: mpsc::UnboundedSender<Event>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send(Event::Detach);
                return;
            }
            Ok(n) => n,
        };
        if let Some(pos) = buf[..n].iter().position(|&b| b == ESCAPE_CHAR) {
            if pos > 0 {
                let _ = events.send(Event::Input(Bytes::copy_from_slice(&buf[..pos])));
            }
            let _ = events.send(Event::Detach);
            return;
        }
        if events
            .send(Event::Input(Bytes::copy_from_slice(&buf[..n])))
            .is_err()
        {
            return;
        }
    }
}

/// SIGWINCH -> Viewport events.
async fn watch_resize(events: mpsc::UnboundedSender<Event>) {
    let mut sigwinch =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to watch terminal size");
                return;
            }
        };
    while sigwinch.recv().await.is_some() {
        let (cols, rows) = terminal_size();
        if events.send(Event::Viewport { cols, rows }).is_err() {
            return;
        }
    }
}
