use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};

use crate::error::SessionError;

/// Non-blocking PTY master, shared by the output and input loops of one
/// bridge.
pub struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> std::io::Result<Self> {
        let raw = fd.as_raw_fd();
        // The child must not inherit the master, and AsyncFd needs O_NONBLOCK
        unsafe {
            nix::libc::fcntl(raw, nix::libc::F_SETFD, nix::libc::FD_CLOEXEC);
            let flags = nix::libc::fcntl(raw, nix::libc::F_GETFL);
            nix::libc::fcntl(raw, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK);
        }
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Read whatever is available. `Ok(0)` means the other side is gone:
    /// Linux reports EIO on the master once every slave fd has closed.
    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    nix::libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> std::io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    nix::libc::write(inner.as_raw_fd(), data.as_ptr() as *const _, data.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the window size (TIOCSWINSZ); the foreground process gets SIGWINCH.
    pub fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        let ws = nix::libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { nix::libc::ioctl(self.fd.as_raw_fd(), nix::libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Current (cols, rows)
    pub fn size(&self) -> std::io::Result<(u16, u16)> {
        let mut ws = nix::libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { nix::libc::ioctl(self.fd.as_raw_fd(), nix::libc::TIOCGWINSZ, &mut ws) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((ws.ws_col, ws.ws_row))
    }
}

/// How long a hung-up process gets to exit before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// A child process running on its own pseudo-terminal.
pub struct PtyProcess {
    master: Arc<PtyMaster>,
    child: Child,
    pid: Option<u32>,
    terminated: bool,
}

impl PtyProcess {
    /// Spawn `argv` as a session leader with the PTY slave as its
    /// controlling terminal. The environment is inherited plus `env`.
    pub fn spawn(
        argv: &[String],
        cols: u16,
        rows: u16,
        env: &[(String, String)],
    ) -> Result<Self, SessionError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SessionError::SpawnFailed("empty command".to_string()))?;

        let winsize = nix::pty::Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = nix::pty::openpty(Some(&winsize), None)
            .map_err(|e| SessionError::SpawnFailed(format!("openpty: {}", e)))?;

        let spawn_err = |e: std::io::Error| SessionError::SpawnFailed(format!("{}: {}", program, e));
        let stdin = pty.slave.try_clone().map_err(spawn_err)?;
        let stdout = pty.slave.try_clone().map_err(spawn_err)?;
        let master = PtyMaster::new(pty.master).map_err(spawn_err)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(pty.slave))
            .kill_on_drop(true);
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        // Drop our slave copies so the master sees EOF when the child exits
        drop(cmd);

        let pid = child.id();
        tracing::debug!(program = %program, pid = ?pid, cols = cols, rows = rows, "Spawned PTY process");

        Ok(Self {
            master: Arc::new(master),
            child,
            pid,
            terminated: false,
        })
    }

    pub fn master(&self) -> Arc<PtyMaster> {
        self.master.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// SIGHUP, then SIGKILL if still running after a short grace, then
    /// reap. Safe to call more than once. Dropping without calling this
    /// kills the child but does not reap it.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                tracing::debug!(pid, error = %e, "SIGHUP on PTY process failed");
            }
            match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(pid, status = %status, "PTY process exited on hangup");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(pid, error = %e, "Failed to wait on PTY process");
                }
                Err(_) => {
                    tracing::debug!(pid, "PTY process ignored hangup");
                }
            }
        }

        if let Err(e) = self.child.start_kill() {
            // Already exited; still reap below
            tracing::debug!(pid = ?self.pid, error = %e, "Kill on PTY process failed");
        }
        match self.child.wait().await {
            Ok(status) => tracing::debug!(pid = ?self.pid, status = %status, "PTY process reaped"),
            Err(e) => tracing::warn!(pid = ?self.pid, error = %e, "Failed to reap PTY process"),
        }
    }
}

/// Check if a process is still alive via kill(pid, 0)
#[cfg(test)]
pub fn is_pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn read_until(master: &PtyMaster, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        let fut = async {
            loop {
                let n = master.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
                if seen.contains(needle) {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut).await.unwrap();
        seen
    }

    #[tokio::test]
    async fn test_spawn_echo_and_eof() {
        let mut p = PtyProcess::spawn(&argv(&["sh", "-c", "echo hello-pty"]), 80, 24, &[]).unwrap();
        let master = p.master();
        let out = read_until(&master, "hello-pty").await;
        assert!(out.contains("hello-pty"));

        let mut buf = [0u8; 64];
        let eof = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if master.read(&mut buf).await.unwrap() == 0 {
                    break;
                }
            }
        })
        .await;
        assert!(eof.is_ok());
        p.terminate().await;
    }

    #[tokio::test]
    async fn test_env_overrides_applied() {
        let env = vec![("TERM".to_string(), "xterm-256color".to_string())];
        let mut p = PtyProcess::spawn(&argv(&["sh", "-c", "echo term=$TERM"]), 80, 24, &env).unwrap();
        let out = read_until(&p.master(), "term=xterm-256color").await;
        assert!(out.contains("term=xterm-256color"));
        p.terminate().await;
    }

    #[tokio::test]
    async fn test_resize_and_size() {
        let mut p = PtyProcess::spawn(&argv(&["cat"]), 120, 40, &[]).unwrap();
        let master = p.master();
        assert_eq!(master.size().unwrap(), (120, 40));
        master.resize(80, 24).unwrap();
        assert_eq!(master.size().unwrap(), (80, 24));
        p.terminate().await;
    }

    #[tokio::test]
    async fn test_write_reaches_child() {
        let mut p = PtyProcess::spawn(&argv(&["cat"]), 80, 24, &[]).unwrap();
        let master = p.master();
        master.write_all(b"ping-line\n").await.unwrap();
        let out = read_until(&master, "ping-line").await;
        assert!(out.contains("ping-line"));
        p.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_kills_process() {
        let mut p = PtyProcess::spawn(&argv(&["sleep", "30"]), 80, 24, &[]).unwrap();
        let pid = p.pid().unwrap();
        assert!(is_pid_alive(pid));
        p.terminate().await;
        assert!(!is_pid_alive(pid));
        p.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_hangup_skips_grace() {
        let mut p = PtyProcess::spawn(&argv(&["sleep", "30"]), 80, 24, &[]).unwrap();
        let pid = p.pid().unwrap();
        let started = std::time::Instant::now();
        p.terminate().await;
        assert!(started.elapsed() < TERMINATE_GRACE);
        assert!(!is_pid_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_kills_process_ignoring_hangup() {
        let mut p = PtyProcess::spawn(
            &argv(&["sh", "-c", "trap '' HUP; echo trapped; while :; do sleep 1; done"]),
            80,
            24,
            &[],
        )
        .unwrap();
        let pid = p.pid().unwrap();
        read_until(&p.master(), "trapped").await;

        let started = std::time::Instant::now();
        p.terminate().await;
        assert!(started.elapsed() >= TERMINATE_GRACE);
        assert!(!is_pid_alive(pid));
    }

    #[test]
    fn test_empty_argv_fails() {
        assert!(matches!(
            PtyProcess::spawn(&[], 80, 24, &[]),
            Err(SessionError::SpawnFailed(_))
        ));
    }
}
