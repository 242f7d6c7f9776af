//! Sandboxed backend: `ffmpeg` compiled to WASI, run in-process by wasmtime.
//!
//! The guest sees a single preopened directory, `/work`, backed by the
//! invocation's scratch [`Workspace`]. The input is copied in, progress is
//! written by the guest to `/work/progress.log` and polled from the host, and
//! stderr is captured in memory for the banner and diagnostics.
//!
//! Cancellation and timeouts use epoch interruption: the host bumps the
//! engine epoch on every poll tick and each store's deadline callback traps
//! the guest once its token is cancelled or its deadline has passed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use wasmtime::{Config, Engine, Linker, Module, Store, UpdateDeadline};
use wasmtime_wasi::p1::{self, WasiP1Ctx};
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::engine::{
    command_line, Backend, ExitState, Invocation, InvocationOutcome, ProgressSink,
    TranscodeEngine, DEFAULT_INVOCATION_TIMEOUT,
};
use crate::error::EngineError;
use crate::progress::{DiagnosticTail, ProgressParser};
use crate::workspace::{Workspace, OUTPUT_FILE};

/// Directory the guest sees as its filesystem.
const GUEST_DIR: &str = "/work";
const GUEST_INPUT: &str = "input.webm";
const PROGRESS_FILE: &str = "progress.log";

/// Maximum guest stderr kept in memory.
const STDERR_CAPACITY: usize = 1024 * 1024;

/// How often the host bumps the epoch and polls progress.
const EPOCH_TICK: Duration = Duration::from_millis(50);

/// Runs a WASI build of `ffmpeg` under wasmtime.
pub struct SandboxEngine {
    engine: Engine,
    module_path: PathBuf,
    module: OnceCell<Module>,
    timeout: Duration,
    scratch_root: Option<PathBuf>,
}

impl SandboxEngine {
    /// Create an engine for the module at `module_path`.
    ///
    /// The module is compiled on first use, so a missing or invalid module is
    /// reported per invocation as [`EngineError::Unavailable`].
    pub fn new(module_path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        config.wasm_threads(false);

        let engine = Engine::new(&config)
            .map_err(|e| EngineError::unavailable(Backend::Sandbox, format!("failed to create wasm engine: {e}")))?;

        Ok(Self {
            engine,
            module_path: module_path.into(),
            module: OnceCell::new(),
            timeout: DEFAULT_INVOCATION_TIMEOUT,
            scratch_root: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    /// Compile the module now instead of on first invocation.
    pub async fn preload(&self) -> Result<(), EngineError> {
        self.module().await.map(|_| ())
    }

    async fn module(&self) -> Result<Module, EngineError> {
        self.module
            .get_or_try_init(|| async {
                let engine = self.engine.clone();
                let path = self.module_path.clone();
                tracing::info!(module = %path.display(), "Compiling sandboxed engine module");
                tokio::task::spawn_blocking(move || Module::from_file(&engine, &path))
                    .await
                    .map_err(|e| EngineError::unavailable(Backend::Sandbox, format!("module compilation aborted: {e}")))?
                    .map_err(|e| {
                        EngineError::unavailable(
                            Backend::Sandbox,
                            format!("failed to load {}: {e:#}", self.module_path.display()),
                        )
                    })
            })
            .await
            .cloned()
    }
}

/// How the guest run ended, as seen from the blocking thread.
enum GuestStatus {
    Exited(i32),
    Trapped(String),
}

/// Everything the blocking thread needs to run the guest once.
struct GuestRun {
    engine: Engine,
    module: Module,
    scratch: PathBuf,
    argv: Vec<String>,
    stderr: MemoryOutputPipe,
    cancel: CancellationToken,
    deadline: Instant,
}

impl GuestRun {
    fn execute(self) -> Result<GuestStatus, EngineError> {
        let unavailable = |e: wasmtime::Error| EngineError::unavailable(Backend::Sandbox, format!("{e:#}"));

        let mut builder = WasiCtxBuilder::new();
        builder.args(self.argv.as_slice()).stderr(self.stderr);
        builder
            .preopened_dir(&self.scratch, GUEST_DIR, DirPerms::all(), FilePerms::all())
            .map_err(unavailable)?;
        builder.env("HOME", GUEST_DIR);
        let wasi: WasiP1Ctx = builder.build_p1();

        let mut store = Store::new(&self.engine, wasi);
        let cancel = self.cancel;
        let deadline = self.deadline;
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |_| {
            if cancel.is_cancelled() {
                return Err(wasmtime::Error::msg("interrupted: cancelled"));
            }
            if Instant::now() >= deadline {
                return Err(wasmtime::Error::msg("interrupted: timed out"));
            }
            Ok(UpdateDeadline::Continue(1))
        });

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        p1::add_to_linker_sync(&mut linker, |cx| cx).map_err(unavailable)?;
        let instance = linker.instantiate(&mut store, &self.module).map_err(unavailable)?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(unavailable)?;

        match start.call(&mut store, ()) {
            Ok(()) => Ok(GuestStatus::Exited(0)),
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(exit) => Ok(GuestStatus::Exited(exit.0)),
                None => Ok(GuestStatus::Trapped(format!("{e:#}"))),
            },
        }
    }
}

/// Feeds newly appended text of a growing file or buffer to the parser.
#[derive(Default)]
struct Cursor {
    offset: usize,
}

impl Cursor {
    fn pump(&mut self, text: &[u8], parser: &mut ProgressParser, sink: &dyn ProgressSink) {
        if text.len() <= self.offset {
            return;
        }
        // Only consume complete lines.
        let fresh = &text[self.offset..];
        let Some(end) = fresh.iter().rposition(|b| *b == b'\n') else {
            return;
        };
        for line in String::from_utf8_lossy(&fresh[..end]).lines() {
            if let Some(ratio) = parser.feed(line) {
                sink.report(ratio);
            }
        }
        self.offset += end + 1;
    }
}

#[async_trait]
impl TranscodeEngine for SandboxEngine {
    fn backend(&self) -> Backend {
        Backend::Sandbox
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, EngineError> {
        let started = Instant::now();
        let module = self.module().await?;

        let workspace = Workspace::new(self.scratch_root.as_deref())?;
        tokio::fs::copy(&invocation.input, workspace.file(GUEST_INPUT)).await?;

        let guest = |name: &str| format!("{GUEST_DIR}/{name}");
        let mut argv = vec!["ffmpeg".to_string()];
        argv.extend(command_line(
            &guest(PROGRESS_FILE),
            &guest(GUEST_INPUT),
            &guest(OUTPUT_FILE),
            &invocation.args,
        ));

        let stderr = MemoryOutputPipe::new(STDERR_CAPACITY);
        let run = GuestRun {
            engine: self.engine.clone(),
            module,
            scratch: workspace.path().to_path_buf(),
            argv,
            stderr: stderr.clone(),
            cancel: cancel.clone(),
            deadline: started + self.timeout,
        };
        tracing::debug!(args = ?run.argv, "Starting sandboxed ffmpeg");

        let mut handle = tokio::task::spawn_blocking(move || run.execute());
        let mut ticker = tokio::time::interval(EPOCH_TICK);
        let mut parser = ProgressParser::new();
        let mut stderr_cursor = Cursor::default();
        let mut progress_cursor = Cursor::default();
        let progress_path = workspace.file(PROGRESS_FILE);

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = ticker.tick() => {
                    self.engine.increment_epoch();
                    stderr_cursor.pump(&stderr.contents(), &mut parser, progress);
                    if let Ok(text) = tokio::fs::read(&progress_path).await {
                        progress_cursor.pump(&text, &mut parser, progress);
                    }
                }
            }
        };

        // Final drain, the guest may have finished between ticks.
        stderr_cursor.pump(&stderr.contents(), &mut parser, progress);
        if let Ok(text) = tokio::fs::read(&progress_path).await {
            progress_cursor.pump(&text, &mut parser, progress);
        }

        let status = joined
            .map_err(|e| EngineError::unavailable(Backend::Sandbox, format!("guest thread failed: {e}")))??;

        let mut tail = DiagnosticTail::default();
        tail.extend_from_text(&String::from_utf8_lossy(&stderr.contents()));

        let (exit, output_len) = match status {
            GuestStatus::Exited(0) => (ExitState::Success, workspace.deliver_output(&invocation.output)?),
            GuestStatus::Exited(code) => (ExitState::Failed { code: Some(code) }, 0),
            GuestStatus::Trapped(_) if cancel.is_cancelled() => (ExitState::Cancelled, 0),
            GuestStatus::Trapped(message) => {
                tail.push(&message);
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
