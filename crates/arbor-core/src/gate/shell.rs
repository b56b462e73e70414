//! Shell gate execution.
//!
//! Commands are argv arrays and are spawned directly -- never through a
//! shell string -- so gated values cannot smuggle shell metacharacters.
//! The whole gate type is opt-in: without the `ARBOR_ENABLE_SHELL_GATES`
//! process-env flag the gate reports `blocked` and the owning block fails
//! with `SHELL_GATES_DISABLED`.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Process-env flag that enables shell gates.
pub const SHELL_GATES_ENV: &str = "ARBOR_ENABLE_SHELL_GATES";

/// Result of executing (or refusing to execute) a shell gate command.
#[derive(Debug, Clone)]
pub struct ShellOutcome {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stderr_snippet: String,
    pub duration_ms: u64,
    /// Audit record: command, exit, and a status of
    /// `executed` / `blocked` / `error` / `timeout`.
    pub audit: Value,
}

/// The audit emitted when shell gates are disabled.
pub fn blocked_audit() -> Value {
    json!({"status": "blocked", "gate_type": "shell"})
}

/// Execute an argv command with captured output and a hard timeout.
///
/// `passed` is true when the exit code matches `expected_exit_code`.
pub async fn run_shell_gate(
    argv: &[String],
    expected_exit_code: i32,
    timeout: Duration,
) -> Result<ShellOutcome> {
    let start = Instant::now();

    let (program, args) = argv
        .split_first()
        .context("shell gate command must not be empty")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn shell gate command {argv:?}"))?;

    // Take the pipes and read them concurrently with waiting so the child
    // cannot deadlock on a full pipe buffer.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    match tokio::time::timeout(timeout, async {
        let (wait_result, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
        (wait_result, stdout, stderr)
    })
    .await
    {
        Ok((Ok(status), _stdout, stderr)) => {
            let exit_code = status.code();
            let passed = exit_code == Some(expected_exit_code);
            Ok(ShellOutcome {
                passed,
                exit_code,
                stderr_snippet: truncate(&stderr, 1024),
                duration_ms: elapsed_ms(start),
                audit: json!({
                    "status": "executed",
                    "gate_type": "shell",
                    "command": argv,
                    "exit_code": exit_code,
                    "expected_exit_code": expected_exit_code,
                }),
            })
        }
        Ok((Err(e), _, _)) => {
            Err(e).with_context(|| format!("failed to wait on shell gate command {argv:?}"))
        }
        Err(_) => {
            let _ = child.kill().await;
            Ok(ShellOutcome {
                passed: false,
                exit_code: None,
                stderr_snippet: format!("command timed out after {}ms", timeout.as_millis()),
                duration_ms: elapsed_ms(start),
                audit: json!({
                    "status": "timeout",
                    "gate_type": "shell",
                    "command": argv,
                }),
            })
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
