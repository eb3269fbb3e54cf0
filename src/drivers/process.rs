//! KL-018: Bounded external calls — subprocesses and futures raced against
//! cancellation and the execution deadline.

use super::ExecutionContext;
use std::future::Future;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Output from a finished subprocess.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("wait error: {0}")]
    Wait(#[source] std::io::Error),
}

/// Race `fut` against cancellation and the deadline. The losing future is
/// dropped.
pub async fn bounded<F, T>(ctx: &ExecutionContext, fut: F) -> Result<T, ProcessError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ProcessError::Cancelled),
        _ = tokio::time::sleep_until(ctx.deadline) => Err(ProcessError::DeadlineExceeded),
        out = fut => Ok(out),
    }
}

/// Run a command to completion. The child is killed if the context is
/// cancelled or the deadline passes first.
pub async fn run(ctx: &ExecutionContext, mut cmd: Command) -> Result<ExecOutput, ProcessError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    tracing::debug!(%program, "running");

    let output = bounded(ctx, child.wait_with_output())
        .await?
        .map_err(ProcessError::Wait)?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx(timeout: Duration) -> ExecutionContext {
        ExecutionContext::new(CancellationToken::new(), timeout)
    }

    fn sh(script: &str) -> Command {
        let mut c = Command::new("sh");
        c.arg("-c").arg(script);
        c
    }

    #[tokio::test]
    async fn test_kl018_echo() {
        let out = run(&ctx(Duration::from_secs(10)), sh("echo hello")).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_kl018_exit_code_and_stderr() {
        let out = run(&ctx(Duration::from_secs(10)), sh("echo oops >&2; exit 42"))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_kl018_cancelled() {
        let c = ctx(Duration::from_secs(30));
        c.cancel.cancel();
        let err = run(&c, sh("sleep 30")).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
    }

    #[tokio::test]
    async fn test_kl018_deadline() {
        let started = std::time::Instant::now();
        let err = run(&ctx(Duration::from_millis(200)), sh("sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_kl018_spawn_failure() {
        let err = run(
            &ctx(Duration::from_secs(5)),
            Command::new("/nonexistent/kiln-tool"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_kl018_bounded_future() {
        let v = bounded(&ctx(Duration::from_secs(5)), async { 7 }).await.unwrap();
        assert_eq!(v, 7);
    }
}
