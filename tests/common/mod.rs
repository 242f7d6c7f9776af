//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a full [`JobController`] over a
//! temporary artifact root and a [`FakeEngine`] that plays back one
//! scripted result per strategy attempt.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use webmforge::accounts::{Account, AccountStore, InMemoryAccountStore};
use webmforge::artifacts::ArtifactStore;
use webmforge::config::Config;
use webmforge::conversion::{JobController, SubmitRequest};
use webmforge::events::EventBus;
use webmforge::server::{create_router, AppContext};
use webmforge_common::{media, CallerId, JobId, JobState, Plan};
use webmforge_engine::{
    Backend, EngineError, ExitState, Invocation, InvocationOutcome, ProgressSink, TranscodeEngine,
};

pub const MB: usize = 1024 * 1024;

/// What the fake engine does for one attempt.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Exit non-zero without output.
    Fail,
    /// Exit zero but write nothing.
    Empty,
    /// Exit zero after writing this many bytes.
    Succeed(usize),
    /// Report the backend as unavailable.
    Unavailable,
    /// Block until cancelled.
    Hang,
    /// Wait, then behave like `Succeed`.
    SlowSucceed(Duration, usize),
    /// Panic inside the engine call.
    Panic,
}

/// One observed invocation.
#[derive(Debug, Clone)]
pub struct Seen {
    pub args: Vec<String>,
    pub input: PathBuf,
    pub input_existed: bool,
}

#[derive(Default)]
pub struct FakeEngine {
    steps: Mutex<Vec<Step>>,
    seen: Mutex<Vec<Seen>>,
}

impl FakeEngine {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().push(step);
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.seen.lock().len()
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock();
        if steps.is_empty() {
            Step::Fail
        } else {
            steps.remove(0)
        }
    }
}

fn outcome(exit: ExitState, output_len: u64, diagnostics: &str) -> InvocationOutcome {
    InvocationOutcome {
        exit,
        output_len,
        diagnostics: diagnostics.to_string(),
        elapsed: Duration::from_millis(5),
    }
}

#[async_trait]
impl TranscodeEngine for FakeEngine {
    fn backend(&self) -> Backend {
        Backend::Process
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, EngineError> {
        self.seen.lock().push(Seen {
            args: invocation.args.clone(),
            input: invocation.input.clone(),
            input_existed: invocation.input.exists(),
        });

        progress.report(0.25);
        progress.report(0.5);

        match self.next_step() {
            Step::Fail => Ok(outcome(
                ExitState::Failed { code: Some(1) },
                0,
                "Could not find tag for codec vp9 in stream #0, codec not currently supported in container",
            )),
            Step::Empty => Ok(outcome(ExitState::Success, 0, "")),
            Step::Succeed(len) => {
                tokio::fs::write(&invocation.output, vec![0x42u8; len]).await?;
                progress.report(1.0);
                Ok(outcome(ExitState::Success, len as u64, ""))
            }
            Step::Unavailable => Err(EngineError::unavailable(
                Backend::Process,
                "ffmpeg not found; is it installed and in PATH?",
            )),
            Step::Hang => {
                cancel.cancelled().await;
                Ok(outcome(ExitState::Cancelled, 0, ""))
            }
            Step::Panic => panic!("engine crashed"),
            Step::SlowSucceed(delay, len) => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(outcome(ExitState::Cancelled, 0, "")),
                    _ = tokio::time::sleep(delay) => {
                        tokio::fs::write(&invocation.output, vec![0x42u8; len]).await?;
                        Ok(outcome(ExitState::Success, len as u64, ""))
                    }
                }
            }
        }
    }
}

/// A bounded-size WebM-looking payload (EBML magic plus filler).
pub fn webm_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len.max(media::EBML_MAGIC.len())];
    bytes[..4].copy_from_slice(&media::EBML_MAGIC);
    bytes
}

pub fn webm_request(len: usize, caller: &str) -> SubmitRequest {
    SubmitRequest::new(webm_bytes(len), "clip.webm", CallerId::new(caller)).media_type(media::WEBM_MEDIA_TYPE)
}

pub struct TestHarness {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub engine: Arc<FakeEngine>,
    pub accounts: Arc<InMemoryAccountStore>,
    pub controller: Arc<JobController>,
}

impl TestHarness {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self::with_config(Config::default(), steps)
    }

    /// Build with `config`, its storage roots redirected into a temp dir.
    pub fn with_config(mut config: Config, steps: impl IntoIterator<Item = Step>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        config.storage.input_dir = dir.path().join("uploads");
        config.storage.output_dir = dir.path().join("output");
        config.storage.temp_dir = dir.path().join("temp");

        let engine = Arc::new(FakeEngine::new(steps));
        let accounts = Arc::new(InMemoryAccountStore::new());
        let store = Arc::new(ArtifactStore::from_config(&config.storage).expect("failed to create store"));
        let events = Arc::new(EventBus::new(64));
        let controller = Arc::new(JobController::new(
            &config,
            engine.clone(),
            store,
            accounts.clone(),
            events,
        ));

        Self {
            dir,
            config: Arc::new(config),
            engine,
            accounts,
            controller,
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        self.controller.store()
    }

    pub fn set_plan(&self, caller: &str, plan: Plan) {
        self.accounts.upsert(Account::new(CallerId::new(caller), plan));
    }

    pub fn router(&self) -> axum::Router {
        create_router(AppContext::new(self.controller.clone(), self.config.clone()))
    }

    /// Files currently present in the uploads directory.
    pub fn upload_files(&self) -> usize {
        count_files(&self.config.storage.input_dir)
    }

    pub fn output_files(&self) -> usize {
        count_files(&self.config.storage.output_dir)
    }

    /// Poll until the job reaches a state matching `pred`.
    pub async fn wait_for_state(&self, id: JobId, pred: impl Fn(JobState) -> bool) -> JobState {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let state = self.controller.progress(id).expect("job exists").state;
            if pred(state) {
                return state;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting, last state {state:?}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn count_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}
