//! Builder for executing external tool commands with timeout and
//! cancellation support.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::engine::Backend;
use crate::error::EngineError;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Output captured from a short-lived tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// How a streamed execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolExit {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use webmforge_engine::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), webmforge_engine::EngineError> {
/// let output = ToolCommand::new(PathBuf::from("ffmpeg"))
///     .arg("-version")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    fn spawn(&self, stdout: Stdio) -> Result<Child, EngineError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| {
            EngineError::unavailable(
                Backend::Process,
                format!("failed to spawn {}: {e}", self.program_name()),
            )
        })
    }

    /// Execute the command to completion, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::Unavailable`] if the process cannot be
    /// spawned, times out or exits with a non-zero status.
    pub async fn execute(&self) -> Result<ToolOutput, EngineError> {
        let child = self.spawn(Stdio::piped())?;
        let program = self.program_name();

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let tool_output = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                if !output.status.success() {
                    return Err(EngineError::unavailable(
                        Backend::Process,
                        format!(
                            "{program} exited with status {}: {}",
                            output.status,
                            tool_output.stderr.trim()
                        ),
                    ));
                }
                Ok(tool_output)
            }
            Ok(Err(e)) => Err(EngineError::Io(e)),
            // The child is dropped with the future and killed on drop.
            Err(_elapsed) => Err(EngineError::unavailable(
                Backend::Process,
                format!("{program} timed out after {:?}", self.timeout),
            )),
        }
    }

    /// Execute the command, delivering each stderr line to `on_line` as it
    /// arrives.
    ///
    /// A non-zero exit is reported as [`ToolExit::Exited`], not an error.
    /// Cancellation and timeout kill the child.
    pub async fn execute_streaming<F>(
        &self,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<ToolExit, EngineError>
    where
        F: FnMut(&str) + Send,
    {
        let mut child = self.spawn(Stdio::null())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Io(std::io::Error::other("stderr was not captured")))?;
        let mut segments = BufReader::new(stderr).split(b'\n');

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut stderr_open = true;
        loop {
            tokio::select! {
                segment = segments.next_segment(), if stderr_open => match segment {
                    Ok(Some(bytes)) => {
                        let line = String::from_utf8_lossy(&bytes);
                        on_line(line.trim_end_matches('\r'));
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        tracing::debug!(tool = %self.program.display(), error = %e, "Lost stderr of tool");
                        stderr_open = false;
                    }
                },
                status = child.wait() => {
                    // Drain what the child wrote before exiting.
                    while let Ok(Some(bytes)) = segments.next_segment().await {
                        let line = String::from_utf8_lossy(&bytes);
                        on_line(line.trim_end_matches('\r'));
                    }
                    return Ok(ToolExit::Exited(status?));
                }
                _ = cancel.cancelled() => {
                    self.kill(&mut child, "cancelled").await;
                    return Ok(ToolExit::Cancelled);
                }
                _ = &mut deadline => {
                    self.kill(&mut child, "timed out").await;
                    return Ok(ToolExit::TimedOut);
                }
            }
        }
    }

    async fn kill(&self, child: &mut tokio::process::Child, why: &str) {
        if let Err(e) = child.kill().await {
            tracing::warn!(tool = %self.program.display(), error = %e, "Failed to kill tool after it {why}");
        }
    }
}
