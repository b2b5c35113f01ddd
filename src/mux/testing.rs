//! In-memory stand-in for the tmux binary.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::executor::{CommandOutput, CommandRunner};
use crate::error::ExecError;

#[derive(Default)]
struct FakeState {
    sessions: BTreeSet<String>,
    calls: Vec<Vec<String>>,
    fail_options: bool,
    server_down: bool,
}

#[derive(Default)]
pub struct FakeTmux {
    state: Mutex<FakeState>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Value following `flag` in `args`
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.trim_start_matches('='))
}

impl FakeTmux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, name: &str) {
        self.state.lock().unwrap().sessions.insert(name.to_string());
    }

    pub fn fail_options(&self, fail: bool) {
        self.state.lock().unwrap().fail_options = fail;
    }

    pub fn set_server_down(&self, down: bool) {
        self.state.lock().unwrap().server_down = down;
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.iter().any(|a| a == subcommand))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeTmux {
    async fn execute(&self, argv: &[String], _timeout: Duration) -> Result<CommandOutput, ExecError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(argv.to_vec());

        // Skip the binary and an optional `-L <socket>`
        let mut args = &argv[1..];
        if args.first().map(|a| a.as_str()) == Some("-L") {
            args = &args[2..];
        }
        let sub = args.first().map(|s| s.as_str()).unwrap_or_default();

        let out = match sub {
            "new-session" => {
                let name = flag_value(args, "-s").unwrap_or_default().to_string();
                if state.sessions.contains(&name) {
                    fail(format!("duplicate session: {}", name))
                } else {
                    state.sessions.insert(name);
                    ok("")
                }
            }
            "has-session" => {
                let name = flag_value(args, "-t").unwrap_or_default();
                if state.sessions.contains(name) {
                    ok("")
                } else {
                    fail(format!("can't find session: {}", name))
                }
            }
            "list-sessions" => {
                if state.server_down {
                    fail("no server running on /tmp/tmux-0/test")
                } else {
                    let lines: String = state
                        .sessions
                        .iter()
                        .map(|s| format!("{}\t1700000000\n", s))
                        .collect();
                    ok(lines)
                }
            }
            "kill-session" => {
                let name = flag_value(args, "-t").unwrap_or_default().to_string();
                if state.sessions.remove(&name) {
                    ok("")
                } else {
                    fail(format!("can't find session: {}", name))
                }
            }
            "set-option" | "set-window-option" => {
                // Option targets resolve `=name` only with a trailing colon
                let raw = args
                    .iter()
                    .position(|a| a == "-t")
                    .and_then(|i| args.get(i + 1))
                    .map(String::as_str)
                    .unwrap_or_default();
                let name = match raw.strip_prefix('=') {
                    Some(exact) => exact.strip_suffix(':'),
                    None => Some(raw.trim_end_matches(':')),
                };
                if state.fail_options {
                    fail("invalid option")
                } else if !name.is_some_and(|n| state.sessions.contains(n)) {
                    fail(format!("no such session: {}", raw))
                } else {
                    ok("")
                }
            }
            other => fail(format!("unknown command: {}", other)),
        };
        Ok(out)
    }
}
