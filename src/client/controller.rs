//! Reconnecting terminal controller as a pure state machine.
//!
//! The controller never does I/O. Each [`Event`] yields a list of
//! [`Action`]s for the driver to execute in order. Every connection attempt
//! and every reconnect timer is stamped with a generation; events carrying
//! an older generation are ignored, so a late close from a connection that
//! was already torn down cannot schedule a reconnect.

use std::time::Duration;

use bytes::Bytes;

use super::backoff::Backoff;

pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Detached,
    Attaching,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SwitchTo(String),
    Detach,
    Opened(Generation),
    Closed(Generation),
    ConnectFailed(Generation),
    /// The server refused the session outright; no reconnect.
    Rejected { generation: Generation, reason: String },
    TimerFired(Generation),
    Viewport { cols: u16, rows: u16 },
    Input(Bytes),
    Output { generation: Generation, data: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect { session_id: String, generation: Generation },
    CloseConnection,
    DisposeRenderer,
    CancelTimer,
    ScheduleReconnect { generation: Generation, delay: Duration },
    SendResize { cols: u16, rows: u16 },
    SendInput(Bytes),
    Render(Bytes),
    Notice(String),
}

pub struct Controller {
    state: ControllerState,
    session_id: Option<String>,
    generation: Generation,
    backoff: Backoff,
    viewport: (u16, u16),
}

impl Controller {
    pub fn new(backoff: Backoff, viewport: (u16, u16)) -> Self {
        Self {
            state: ControllerState::Detached,
            session_id: None,
            generation: 0,
            backoff,
            viewport,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[cfg(test)]
    pub fn viewport(&self) -> (u16, u16) {
        self.viewport
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::SwitchTo(session_id) => {
                let mut actions = self.teardown();
                self.session_id = Some(session_id);
                actions.push(self.connect());
                actions
            }
            Event::Detach => {
                let actions = self.teardown();
                self.session_id = None;
                self.state = ControllerState::Detached;
                actions
            }
            Event::Opened(generation) => {
                if !self.is_current(generation) || self.state != ControllerState::Attaching {
                    return Vec::new();
                }
                self.state = ControllerState::Connected;
                self.backoff.reset();
                let (cols, rows) = self.viewport;
                vec![Action::SendResize { cols, rows }]
            }
            Event::Closed(generation) | Event::ConnectFailed(generation) => {
                if !self.is_current(generation) || !self.is_active() {
                    return Vec::new();
                }
                self.state = ControllerState::Reconnecting;
                let delay = self.backoff.next_delay();
                vec![
                    Action::Notice(format!("[disconnected, retrying in {}ms]", delay.as_millis())),
                    Action::ScheduleReconnect { generation, delay },
                ]
            }
            Event::Rejected { generation, reason } => {
                if !self.is_current(generation) || !self.is_active() {
                    return Vec::new();
                }
                let mut actions = self.teardown();
                self.session_id = None;
                self.state = ControllerState::Detached;
                actions.push(Action::Notice(format!("[{}]", reason)));
                actions
            }
            Event::TimerFired(generation) => {
                if !self.is_current(generation) || self.state != ControllerState::Reconnecting {
                    return Vec::new();
                }
                vec![self.connect()]
            }
            Event::Viewport { cols, rows } => {
                self.viewport = (cols, rows);
                if self.state == ControllerState::Connected {
                    vec![Action::SendResize { cols, rows }]
                } else {
                    Vec::new()
                }
            }
            Event::Input(data) => {
                if self.state == ControllerState::Connected {
                    vec![Action::SendInput(data)]
                } else {
                    Vec::new()
                }
            }
            Event::Output { generation, data } => {
                if self.is_current(generation) && self.state == ControllerState::Connected {
                    vec![Action::Render(data)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn is_current(&self, generation: Generation) -> bool {
        generation == self.generation
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ControllerState::Attaching | ControllerState::Connected
        )
    }

    /// Drop whatever the current attachment holds. Bumping the generation
    /// makes every in-flight event stale.
    fn teardown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            ControllerState::Detached => {}
            ControllerState::Attaching | ControllerState::Connected => {
                actions.push(Action::CloseConnection);
                actions.push(Action::DisposeRenderer);
            }
            ControllerState::Reconnecting => {
                actions.push(Action::CancelTimer);
                actions.push(Action::DisposeRenderer);
            }
        }
        self.generation += 1;
        self.backoff.reset();
        actions
    }

    fn connect(&mut self) -> Action {
        self.generation += 1;
        self.state = ControllerState::Attaching;
        Action::Connect {
            session_id: self.session_id.clone().unwrap_or_default(),
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Controller {
        Controller::new(
            Backoff::new(Duration::from_millis(100), Duration::from_millis(400)),
            (120, 40),
        )
    }

    fn connect_gen(actions: &[Action]) -> Generation {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Connect { generation, .. } => Some(*generation),
                _ => None,
            })
            .expect("no connect action")
    }

    fn schedule(actions: &[Action]) -> Option<(Generation, Duration)> {
        actions.iter().find_map(|a| match a {
            Action::ScheduleReconnect { generation, delay } => Some((*generation, *delay)),
            _ => None,
        })
    }

    #[test]
    fn test_switch_from_detached_connects() {
        let mut c = controller();
        let actions = c.handle(Event::SwitchTo("chat-1".to_string()));
        assert_eq!(
            actions,
            vec![Action::Connect {
                session_id: "chat-1".to_string(),
                generation: c.generation()
            }]
        );
        assert_eq!(c.state(), ControllerState::Attaching);
    }

    #[test]
    fn test_opened_sends_viewport() {
        let mut c = controller();
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        c.handle(Event::Viewport { cols: 90, rows: 30 });
        let actions = c.handle(Event::Opened(g));
        assert_eq!(actions, vec![Action::SendResize { cols: 90, rows: 30 }]);
        assert_eq!(c.state(), ControllerState::Connected);
    }

    #[test]
    fn test_input_only_when_connected() {
        let mut c = controller();
        assert!(c.handle(Event::Input(Bytes::from_static(b"x"))).is_empty());
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        assert!(c.handle(Event::Input(Bytes::from_static(b"x"))).is_empty());
        c.handle(Event::Opened(g));
        assert_eq!(
            c.handle(Event::Input(Bytes::from_static(b"ls\r"))),
            vec![Action::SendInput(Bytes::from_static(b"ls\r"))]
        );
    }

    #[test]
    fn test_reconnect_with_growing_delay() {
        let mut c = controller();
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        c.handle(Event::Opened(g));

        let (tg, delay) = schedule(&c.handle(Event::Closed(g))).unwrap();
        assert_eq!(delay, Duration::from_millis(100));
        assert_eq!(c.state(), ControllerState::Reconnecting);

        let g2 = connect_gen(&c.handle(Event::TimerFired(tg)));
        assert!(g2 > g);
        let (tg2, delay) = schedule(&c.handle(Event::ConnectFailed(g2))).unwrap();
        assert_eq!(delay, Duration::from_millis(200));

        let g3 = connect_gen(&c.handle(Event::TimerFired(tg2)));
        let (_, delay) = schedule(&c.handle(Event::ConnectFailed(g3))).unwrap();
        assert_eq!(delay, Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_resets_after_open() {
        let mut c = controller();
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        let (tg, _) = schedule(&c.handle(Event::ConnectFailed(g))).unwrap();
        let g2 = connect_gen(&c.handle(Event::TimerFired(tg)));
        c.handle(Event::Opened(g2));
        let (_, delay) = schedule(&c.handle(Event::Closed(g2))).unwrap();
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn test_detach_suppresses_pending_reconnect() {
        let mut c = controller();
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        c.handle(Event::Opened(g));
        let (tg, _) = schedule(&c.handle(Event::Closed(g))).unwrap();

        let actions = c.handle(Event::Detach);
        assert!(actions.contains(&Action::CancelTimer));
        assert_eq!(c.state(), ControllerState::Detached);
        assert!(c.handle(Event::TimerFired(tg)).is_empty());
        assert_eq!(c.state(), ControllerState::Detached);
    }

    #[test]
    fn test_stale_close_after_switch_is_ignored() {
        let mut c = controller();
        let g1 = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        c.handle(Event::Opened(g1));

        let actions = c.handle(Event::SwitchTo("chat-2".to_string()));
        assert_eq!(actions[0], Action::CloseConnection);
        assert_eq!(actions[1], Action::DisposeRenderer);
        let g2 = connect_gen(&actions);

        // The old connection's close arrives after the switch
        assert!(c.handle(Event::Closed(g1)).is_empty());
        assert_eq!(c.state(), ControllerState::Attaching);
        assert!(c
            .handle(Event::Output {
                generation: g1,
                data: Bytes::from_static(b"old")
            })
            .is_empty());

        c.handle(Event::Opened(g2));
        assert_eq!(c.session_id(), Some("chat-2"));
        assert_eq!(
            c.handle(Event::Output {
                generation: g2,
                data: Bytes::from_static(b"new")
            }),
            vec![Action::Render(Bytes::from_static(b"new"))]
        );
    }

    #[test]
    fn test_switch_while_reconnecting_cancels_timer() {
        let mut c = controller();
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        let (tg, _) = schedule(&c.handle(Event::ConnectFailed(g))).unwrap();

        let actions = c.handle(Event::SwitchTo("chat-2".to_string()));
        assert_eq!(actions[0], Action::CancelTimer);
        assert!(c.handle(Event::TimerFired(tg)).is_empty());
        assert_eq!(c.state(), ControllerState::Attaching);
    }

    #[test]
    fn test_viewport_forwarded_only_when_connected() {
        let mut c = controller();
        assert!(c.handle(Event::Viewport { cols: 100, rows: 30 }).is_empty());
        assert_eq!(c.viewport(), (100, 30));
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        c.handle(Event::Opened(g));
        assert_eq!(
            c.handle(Event::Viewport { cols: 80, rows: 24 }),
            vec![Action::SendResize { cols: 80, rows: 24 }]
        );
    }

    #[test]
    fn test_rejected_detaches_without_retry() {
        let mut c = controller();
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-gone".to_string())));
        let actions = c.handle(Event::Rejected {
            generation: g,
            reason: "session not found".to_string(),
        });
        assert!(schedule(&actions).is_none());
        assert!(actions.contains(&Action::Notice("[session not found]".to_string())));
        assert_eq!(c.state(), ControllerState::Detached);
    }

    #[test]
    fn test_duplicate_open_ignored() {
        let mut c = controller();
        let g = connect_gen(&c.handle(Event::SwitchTo("chat-1".to_string())));
        assert_eq!(c.handle(Event::Opened(g)).len(), 1);
        assert!(c.handle(Event::Opened(g)).is_empty());
    }
}
