//! Subprocess backend: runs an external `ffmpeg`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::{ToolCommand, ToolExit};
use crate::engine::{
    command_line, Backend, ExitState, Invocation, InvocationOutcome, ProgressSink,
    TranscodeEngine, DEFAULT_INVOCATION_TIMEOUT,
};
use crate::error::EngineError;
use crate::progress::{DiagnosticTail, ProgressParser};
use crate::tools::ToolRegistry;
use crate::workspace::Workspace;

/// Runs `ffmpeg` as a child process, reading `-progress pipe:2` from stderr.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    timeout: Duration,
    scratch_root: Option<PathBuf>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_INVOCATION_TIMEOUT,
            scratch_root: None,
        }
    }

    /// Use the discovered `ffmpeg`, or the bare name when discovery failed
    /// (each invocation then reports the backend as unavailable).
    pub fn from_registry(registry: &ToolRegistry) -> Self {
        match registry.require("ffmpeg") {
            Ok(tool) => Self::new(tool.path.clone()),
            Err(e) => {
                tracing::warn!(error = %e, "ffmpeg not discovered, conversions will fail until it is installed");
                Self::new("ffmpeg")
            }
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create per-invocation scratch directories under `root`.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl TranscodeEngine for ProcessEngine {
    fn backend(&self) -> Backend {
        Backend::Process
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, EngineError> {
        let started = Instant::now();
        let workspace = Workspace::new(self.scratch_root.as_deref())?;
        let scratch_output = workspace.output();

        let argv = command_line(
            "pipe:2",
            &invocation.input.to_string_lossy(),
            &scratch_output.to_string_lossy(),
            &invocation.args,
        );
        tracing::debug!(program = %self.program.display(), args = ?argv, "Spawning ffmpeg");

        let mut parser = ProgressParser::new();
        let mut tail = DiagnosticTail::default();
        let exit = ToolCommand::new(self.program.clone())
            .args(argv)
            .timeout(self.timeout)
            .execute_streaming(cancel, |line| {
                if let Some(ratio) = parser.feed(line) {
                    progress.report(ratio);
                }
                tail.push(line);
            })
            .await?;

        let (exit, output_len) = match exit {
            ToolExit::Exited(status) if status.success() => {
                (ExitState::Success, workspace.deliver_output(&invocation.output)?)
            }
            ToolExit::Exited(status) => (ExitState::Failed { code: status.code() }, 0),
            ToolExit::Cancelled => (ExitState::Cancelled, 0),
            ToolExit::TimedOut => {
                tail.push(&format!("timed out after {:?}", self.timeout));
                (ExitState::Failed { code: None }, 0)
            }
        };

        Ok(InvocationOutcome {
            exit,
            output_len,
            diagnostics: tail.render(),
            elapsed: started.elapsed(),
        })
    }
}
