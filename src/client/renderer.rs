use std::os::fd::AsFd;

use anyhow::{Context, Result};
use nix::sys::termios::{self, SetArg, Termios};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Puts the local terminal in raw mode; restores it on drop.
pub struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        let stdin = std::io::stdin();
        let original = termios::tcgetattr(stdin.as_fd())
            .context("Failed to get terminal attributes (not a terminal?)")?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)
            .context("Failed to enter raw mode")?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.original);
    }
}

/// Local terminal size as (cols, rows), 120x40 when stdin is not a tty.
pub fn terminal_size() -> (u16, u16) {
    let mut ws = nix::libc::winsize {
        ws_row: 40,
        ws_col: 120,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        nix::libc::ioctl(0, nix::libc::TIOCGWINSZ, &mut ws);
    }
    (ws.ws_col, ws.ws_row)
}

/// Writes the remote byte stream to the local terminal.
pub struct Renderer<W> {
    out: W,
    dirty: bool,
}

impl Renderer<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, dirty: false }
    }

    pub async fn render(&mut self, data: &[u8]) -> Result<()> {
        self.dirty = true;
        self.out.write_all(data).await?;
        self.out.flush().await?;
        Ok(())
    }

    /// A dimmed status line between remote output.
    pub async fn notice(&mut self, text: &str) -> Result<()> {
        let msg = format!("\r\n\x1b[2m{}\x1b[0m\r\n", text);
        self.out.write_all(msg.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    /// Reset attributes and the cursor left behind by the old stream.
    pub async fn dispose(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;
        self.out.write_all(b"\x1b[0m\x1b[?25h\r\n").await?;
        self.out.flush().await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_render_and_notice() {
        let mut r = Renderer::new(Vec::new());
        r.render(b"hello").await.unwrap();
        r.notice("[detached]").await.unwrap();
        let out = String::from_utf8(r.into_inner()).unwrap();
        assert!(out.starts_with("hello"));
        assert!(out.contains("\x1b[2m[detached]\x1b[0m"));
    }

    #[tokio::test]
    async fn test_dispose_only_after_output() {
        let mut r = Renderer::new(Vec::new());
        r.dispose().await.unwrap();
        r.render(b"x").await.unwrap();
        r.dispose().await.unwrap();
        r.dispose().await.unwrap();
        let out = r.into_inner();
        assert_eq!(out, b"x\x1b[0m\x1b[?25h\r\n");
    }
}
