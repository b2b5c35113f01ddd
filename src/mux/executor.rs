use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::ExecError;

/// Captured result of a finished command. A non-zero exit code is a normal
/// result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one external command to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError>;
}

/// Runs commands as child processes on tokio's process driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct Executor;

#[async_trait]
impl CommandRunner for Executor {
    async fn execute(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
        let (program, args) = argv.split_first().ok_or_else(|| ExecError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let io_err = |source| ExecError::Io {
            program: program.clone(),
            source,
        };
        let missing = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe not captured");
        let mut stdout = child.stdout.take().ok_or_else(missing).map_err(io_err)?;
        let mut stderr = child.stderr.take().ok_or_else(missing).map_err(io_err)?;

        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (o, e, status) = tokio::join!(
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err),
                child.wait()
            );
            o?;
            e?;
            Ok::<_, std::io::Error>((status?, out, err))
        };

        let result = tokio::time::timeout(timeout, run).await;
        match result {
            Ok(Ok((status, out, err))) => Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            }),
            Ok(Err(source)) => Err(io_err(source)),
            Err(_) => {
                // Kill and reap so the timed-out child never lingers
                let _ = child.start_kill();
                let _ = child.wait().await;
                tracing::warn!(program = %program, timeout = ?timeout, "Command timed out, killed");
                Err(ExecError::Timeout {
                    program: program.clone(),
                    after: timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let out = Executor
            .execute(
                &argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_success() {
        let out = Executor
            .execute(&argv(&["true"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let start = std::time::Instant::now();
        let err = Executor
            .execute(&argv(&["sleep", "10"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_argv_is_spawn_error() {
        let err = Executor.execute(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = Executor
            .execute(&argv(&["/nonexistent/shellmux-binary"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
