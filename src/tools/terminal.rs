//! Shell command execution for the `terminal` tool.
//!
//! Commands run under a 30-second deadline on `sh -c` (POSIX) or
//! `cmd.exe /C` (Windows, after a small compatibility rewrite). Partial
//! output captured before a failure is always handed back with the error.

use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::llm::ToolDef;

pub const TERMINAL_TOOL: &str = "terminal";

/// Default command deadline in seconds.
pub const COMMAND_TIMEOUT_SECS: u64 = 30;

/// A failed execution still carries whatever output was captured.
#[derive(Debug)]
pub struct ToolFailure {
    pub error: String,
    pub output: String,
}

#[derive(Clone)]
pub struct TerminalTool {
    timeout_secs: u64,
    working_dir: PathBuf,
}

impl TerminalTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            timeout_secs: COMMAND_TIMEOUT_SECS,
            working_dir,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Tool definition sent to the model.
    pub fn definition() -> ToolDef {
        ToolDef {
            name: TERMINAL_TOOL.to_string(),
            description: "Execute a shell command in the session's working directory \
                          and return its combined output."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute."
                    }
                },
                "required": ["command"]
            }),
        }
    }

    /// Command string as it will actually run, platform rewrite included.
    pub fn resolved_command(&self, command: &str) -> String {
        if cfg!(windows) {
            windows_compat(command)
        } else {
            command.to_string()
        }
    }

    /// Execute a raw command string under the deadline.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        command: &str,
    ) -> Result<String, ToolFailure> {
        let command = self.resolved_command(command);

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd.exe");
            c.args(["/C", command.as_str()]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command.as_str()]);
            c
        };
        cmd.current_dir(&self.working_dir);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ToolFailure {
            error: format!("failed to spawn command: {e}"),
            output: String::new(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let deadline = Duration::from_secs(self.timeout_secs);
        // `waited` is None on cancellation; the wait future (and its borrow
        // of the child) is dropped before the child is killed below.
        let waited = tokio::select! {
            _ = ctx.cancelled() => None,
            waited = tokio::time::timeout(deadline, child.wait()) => Some(waited),
        };

        let status = match waited {
            None => {
                let output = Self::kill_and_collect(child, stdout_handle, stderr_handle).await;
                return Err(ToolFailure {
                    error: "command cancelled".to_string(),
                    output,
                });
            }
            Some(Ok(Ok(status))) => status,
            Some(Ok(Err(e))) => {
                return Err(ToolFailure {
                    error: format!("command wait failed: {e}"),
                    output: String::new(),
                });
            }
            Some(Err(_)) => {
                let output = Self::kill_and_collect(child, stdout_handle, stderr_handle).await;
                return Err(ToolFailure {
                    error: format!("command timed out after {}s", self.timeout_secs),
                    output,
                });
            }
        };

        let output = Self::collect(stdout_handle, stderr_handle).await;
        if status.success() {
            Ok(output)
        } else {
            Err(ToolFailure {
                error: format!("command failed (exit {})", status.code().unwrap_or(-1)),
                output,
            })
        }
    }

    async fn kill_and_collect(
        mut child: tokio::process::Child,
        stdout_handle: tokio::task::JoinHandle<Vec<u8>>,
        stderr_handle: tokio::task::JoinHandle<Vec<u8>>,
    ) -> String {
        let _ = child.kill().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        Self::collect(stdout_handle, stderr_handle).await
    }

    async fn collect(
        stdout_handle: tokio::task::JoinHandle<Vec<u8>>,
        stderr_handle: tokio::task::JoinHandle<Vec<u8>>,
    ) -> String {
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();
        combine_output(
            &String::from_utf8_lossy(&stdout),
            &String::from_utf8_lossy(&stderr),
        )
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut result = String::new();
    if !stdout.is_empty() {
        result.push_str(stdout);
    }
    if !stderr.is_empty() {
        if !result.is_empty() && !result.ends_with('\n') {
            result.push('\n');
        }
        result.push_str(stderr);
    }
    result
}

/// Rewrite a leading `ls` token for `cmd.exe`: `ls` becomes `dir`, a `-a`
/// flag becomes `/a`, positional paths are preserved.
pub(crate) fn windows_compat(command: &str) -> String {
    let mut tokens = command.split_whitespace();
    match tokens.next() {
        Some("ls") => {}
        _ => return command.to_string(),
    }

    let mut all = false;
    let mut paths = Vec::new();
    for token in tokens {
        if let Some(flags) = token.strip_prefix('-') {
            if flags.contains('a') {
                all = true;
            }
        } else {
            paths.push(token);
        }
    }

    let mut out = String::from("dir");
    if all {
        out.push_str(" /a");
    }
    for path in paths {
        out.push(' ');
        out.push_str(path);
    }
    out
}
