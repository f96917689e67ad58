//! Shell execution under the sandbox policy.
//!
//! Runs `sh -c` with the workspace root as working directory, a hard
//! wall-clock kill, and output truncation. The policy check happens before
//! any subprocess is spawned.

use std::path::Path;
use std::time::Duration;

use osa_domain::error::{Error, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::sandbox;

/// Cap on captured output (stdout + stderr combined).
pub const MAX_OUTPUT_BYTES: usize = 100 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated at 100 KB]";

/// Execute a shell command and return its merged output.
///
/// Refused commands return [`Error::ToolBlocked`] without spawning;
/// overruns of `timeout` kill the process and return [`Error::Timeout`].
pub async fn shell_execute(
    command: &str,
    workspace_root: &Path,
    timeout: Duration,
) -> Result<String> {
    sandbox::validate(command, workspace_root).map_err(Error::ToolBlocked)?;
    let cmd_line = sandbox::normalize(command);

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&cmd_line)
        .current_dir(workspace_root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(Error::Io)?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut out) = stdout {
            let _ = out.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut err) = stderr {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(Error::Io)?;
            let out = stdout_task.await.unwrap_or_default();
            let err = stderr_task.await.unwrap_or_default();
            let mut combined = String::from_utf8_lossy(&out).into_owned();
            if !err.is_empty() {
                if !combined.is_empty() && !combined.ends_with('\n') {
                    combined.push('\n');
                }
                combined.push_str(&String::from_utf8_lossy(&err));
            }
            let mut output = truncate_output(combined);
            if !status.success() {
                let code = status.code().unwrap_or(-1);
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(&format!("[exit code: {code}]"));
            }
            Ok(output)
        }
        _ = tokio::time::sleep(timeout) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(Error::Timeout(format!(
                "command exceeded {}s wall-clock limit",
                timeout.as_secs()
            )))
        }
    }
}

/// Truncate merged output at [`MAX_OUTPUT_BYTES`] with an explicit marker,
/// backing up to a char boundary.
fn truncate_output(mut output: String) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output;
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    output.truncate(end);
    output.push_str(TRUNCATION_MARKER);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let dir = ws();
        let out = shell_execute("echo hello", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn blocked_command_never_spawns() {
        let dir = ws();
        let marker = dir.path().join("should_not_exist");
        let cmd = format!("rm -f x; touch {}", marker.display());
        let err = shell_execute(&cmd, dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolBlocked(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let dir = ws();
        let err = shell_execute("sleep 10", dir.path(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_in_output() {
        let dir = ws();
        let out = shell_execute("sh -c 'exit 3'", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.contains("[exit code: 3]"));
    }

    #[tokio::test]
    async fn stderr_is_merged() {
        let dir = ws();
        let out = shell_execute("echo err 1>&2", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.contains("err"));
    }

    #[test]
    fn truncation_appends_marker() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 10);
        let out = truncate_output(big);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(out.len() <= MAX_OUTPUT_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn small_output_untouched() {
        assert_eq!(truncate_output("ok".into()), "ok");
    }
}
