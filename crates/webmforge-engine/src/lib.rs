//! # webmforge-engine
//!
//! Execution environment adapter for the conversion pipeline.
//!
//! One contract, [`TranscodeEngine::invoke`], over two backends selected at
//! startup:
//!
//! - **Process** ([`ProcessEngine`]) spawns an external `ffmpeg` and parses
//!   its `-progress` output from stderr.
//! - **Sandbox** ([`SandboxEngine`]) runs an `ffmpeg` build compiled to WASI
//!   inside wasmtime, with a scratch directory preopened as its filesystem.
//!
//! Both report engine failures as an [`InvocationOutcome`] and reserve
//! [`EngineError`] for infrastructure failures.

pub mod command;
pub mod engine;
pub mod error;
pub mod process;
pub mod progress;
pub mod sandbox;
pub mod tools;
pub mod workspace;

pub use command::{ToolCommand, ToolExit, ToolOutput};
pub use engine::{
    command_line, Backend, ExitState, Invocation, InvocationOutcome, ProgressSink,
    TranscodeEngine,
};
pub use error::EngineError;
pub use process::ProcessEngine;
pub use progress::{DiagnosticTail, ProgressParser};
pub use sandbox::SandboxEngine;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use workspace::Workspace;
