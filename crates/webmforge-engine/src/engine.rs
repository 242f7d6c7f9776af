//! The transcode capability shared by every backend.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Default maximum duration of one invocation: 24 hours.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Which execution substrate runs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// External `ffmpeg` subprocess.
    #[default]
    Process,
    /// `ffmpeg` compiled to WASI, run in-process by wasmtime.
    Sandbox,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Process => "process",
            Backend::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "subprocess" => Ok(Backend::Process),
            "sandbox" | "wasm" | "wasi" => Ok(Backend::Sandbox),
            other => Err(format!("unknown engine backend: {other}")),
        }
    }
}

/// One engine run: transcode `input` into `output` with strategy `args`.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub input: PathBuf,
    pub output: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            args,
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "exit", rename_all = "snake_case")]
pub enum ExitState {
    Success,
    /// Non-zero exit, trap or timeout. `code` is absent when the engine did
    /// not exit on its own.
    Failed { code: Option<i32> },
    Cancelled,
}

/// Result of a completed invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub exit: ExitState,
    /// Bytes written to `Invocation::output` (0 when nothing was produced).
    pub output_len: u64,
    /// Tail of the engine's diagnostic output.
    pub diagnostics: String,
    pub elapsed: Duration,
}

impl InvocationOutcome {
    /// A healthy exit that produced a non-empty output.
    pub fn is_healthy(&self) -> bool {
        self.exit == ExitState::Success && self.output_len > 0
    }

    /// Short failure reason for logs and the chain's last diagnostic.
    pub fn failure_reason(&self) -> String {
        match self.exit {
            ExitState::Success if self.output_len == 0 => "engine produced an empty output".to_string(),
            ExitState::Success => "ok".to_string(),
            ExitState::Cancelled => "cancelled".to_string(),
            ExitState::Failed { code } => {
                let status = match code {
                    Some(code) => format!("engine exited with code {code}"),
                    None => "engine terminated abnormally".to_string(),
                };
                if self.diagnostics.is_empty() {
                    status
                } else {
                    format!("{status}: {}", self.diagnostics)
                }
            }
        }
    }
}

/// Receives progress ratios (0.0 to 1.0) from a running invocation.
pub trait ProgressSink: Send + Sync {
    fn report(&self, ratio: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, ratio: f64) {
        self(ratio)
    }
}

/// Run a transcode command and observe its progress and exit.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    fn backend(&self) -> Backend;

    /// Run one invocation to completion.
    ///
    /// The output file exists after this returns only when the engine exited
    /// successfully. Engine-internal copies of the input are removed before
    /// returning.
    async fn invoke(
        &self,
        invocation: &Invocation,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, EngineError>;
}

/// Compose the full ffmpeg argument vector (without program name).
pub fn command_line(progress_target: &str, input: &str, output: &str, args: &[String]) -> Vec<String> {
    let mut argv: Vec<String> = [
        "-hide_banner",
        "-y",
        "-nostats",
        "-progress",
        progress_target,
        "-i",
        input,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    argv.extend(args.iter().cloned());
    argv.push(output.to_string());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_layout() {
        let args = vec!["-c".to_string(), "copy".to_string()];
        let argv = command_line("pipe:2", "in.webm", "out.mp4", &args);
        assert_eq!(
            argv,
            vec!["-hide_banner", "-y", "-nostats", "-progress", "pipe:2", "-i", "in.webm", "-c", "copy", "out.mp4"]
        );
    }

    #[test]
    fn healthy_requires_output() {
        let mut outcome = InvocationOutcome {
            exit: ExitState::Success,
            output_len: 0,
            diagnostics: String::new(),
            elapsed: Duration::ZERO,
        };
        assert!(!outcome.is_healthy());
        assert_eq!(outcome.failure_reason(), "engine produced an empty output");
        outcome.output_len = 10;
        assert!(outcome.is_healthy());
    }

    #[test]
    fn failure_reason_includes_diagnostics() {
        let outcome = InvocationOutcome {
            exit: ExitState::Failed { code: Some(1) },
            output_len: 0,
            diagnostics: "Invalid data found when processing input".into(),
            elapsed: Duration::ZERO,
        };
        assert_eq!(
            outcome.failure_reason(),
            "engine exited with code 1: Invalid data found when processing input"
        );
    }

    #[test]
    fn backend_parse() {
        assert_eq!("Sandbox".parse::<Backend>().unwrap(), Backend::Sandbox);
        assert_eq!("process".parse::<Backend>().unwrap(), Backend::Process);
        assert!("docker".parse::<Backend>().is_err());
        let json = serde_json::to_string(&Backend::Sandbox).unwrap();
        assert_eq!(json, r#""sandbox""#);
    }

    #[test]
    fn closures_are_sinks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |r: f64| seen.lock().unwrap().push(r);
        sink.report(0.5);
        assert_eq!(*seen.lock().unwrap(), vec![0.5]);
    }
}
