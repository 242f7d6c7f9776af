//! Strategy chain executor.
//!
//! Tries each strategy in order until one exits healthy with a non-empty
//! output. Attempts are strictly sequential and every attempt writes into a
//! fresh output artifact, released before the next attempt starts.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::progress::ProgressReporter;
use super::strategy::TranscodeStrategy;
use crate::artifacts::{ArtifactStore, StagedArtifact};
use crate::events::{EventBus, EventPayload};
use webmforge_common::{media, ArtifactRole, Error, JobId, Result};
use webmforge_engine::{ExitState, Invocation, TranscodeEngine};

/// A successful chain run.
#[derive(Debug, Clone)]
pub struct ChainSuccess {
    /// The output artifact, still unpublished.
    pub output: StagedArtifact,
    pub strategy: String,
    pub strategy_index: usize,
    /// Attempts made, including the successful one.
    pub attempts: usize,
}

pub struct StrategyChain {
    engine: Arc<dyn TranscodeEngine>,
    store: Arc<ArtifactStore>,
    events: Option<Arc<EventBus>>,
}

impl StrategyChain {
    pub fn new(engine: Arc<dyn TranscodeEngine>, store: Arc<ArtifactStore>) -> Self {
        Self {
            engine,
            store,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn engine(&self) -> &Arc<dyn TranscodeEngine> {
        &self.engine
    }

    /// Run `strategies` against `input`.
    ///
    /// # Errors
    ///
    /// - `StrategyExhausted` when no attempt produced a non-empty output
    ///   (an empty chain counts as zero attempts).
    /// - `EnvironmentUnavailable` or `Io` when the engine itself failed;
    ///   the chain stops at once.
    /// - `Cancelled` when `cancel` fired during an attempt.
    ///
    /// On every error path no output artifact of this run is left tracked.
    pub async fn run(
        &self,
        input: &Path,
        strategies: &[TranscodeStrategy],
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
        owner: Option<JobId>,
    ) -> Result<ChainSuccess> {
        let count = strategies.len();
        let mut last_failure: Option<String> = None;

        for (index, strategy) in strategies.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            reporter.begin_attempt(index, strategy.name());
            self.emit(owner, |job_id| EventPayload::AttemptStarted {
                job_id,
                strategy: strategy.name().to_string(),
                index,
                count,
            });
            tracing::info!(
                strategy = strategy.name(),
                attempt = index + 1,
                of = count,
                backend = %self.engine.backend(),
                "Starting conversion attempt"
            );

            let output = self
                .store
                .allocate(ArtifactRole::Output, owner, media::MP4_EXTENSION)
                .await?;
            let invocation = Invocation::new(input, &output.path, strategy.args().to_vec());
            let sink = reporter.attempt_sink(index);

            let outcome = match self.engine.invoke(&invocation, &sink, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.store.release(output.id);
                    tracing::error!(strategy = strategy.name(), error = %e, "Engine failed to run");
                    return Err(e.into());
                }
            };

            if outcome.is_healthy() {
                tracing::info!(
                    strategy = strategy.name(),
                    bytes = outcome.output_len,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Conversion attempt succeeded"
                );
                return Ok(ChainSuccess {
                    output,
                    strategy: strategy.name().to_string(),
                    strategy_index: index,
                    attempts: index + 1,
                });
            }

            self.store.release(output.id);

            if outcome.exit == ExitState::Cancelled || cancel.is_cancelled() {
                tracing::info!(strategy = strategy.name(), "Conversion attempt cancelled");
                return Err(Error::Cancelled);
            }

            let reason = outcome.failure_reason();
            tracing::warn!(
                strategy = strategy.name(),
                attempt = index + 1,
                reason = %reason,
                "Conversion attempt failed"
            );
            self.emit(owner, |job_id| EventPayload::AttemptFailed {
                job_id,
                strategy: strategy.name().to_string(),
                reason: reason.clone(),
            });
            last_failure = Some(format!("{}: {}", strategy.name(), reason));
        }

        Err(Error::StrategyExhausted {
            attempts: count,
            detail: last_failure.unwrap_or_else(|| "no strategies configured".to_string()),
        })
    }

    fn emit(&self, owner: Option<JobId>, payload: impl FnOnce(JobId) -> EventPayload) {
        if let (Some(bus), Some(job_id)) = (&self.events, owner) {
            bus.publish(payload(job_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactRoots, ExpiryPolicy};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use webmforge_engine::{Backend, EngineError, InvocationOutcome, ProgressSink};

    /// Engine that plays back one scripted result per attempt.
    struct Scripted {
        steps: Mutex<Vec<Step>>,
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[derive(Clone, Copy)]
    enum Step {
        Fail,
        Empty,
        Write(usize),
        Unavailable,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TranscodeEngine for Scripted {
        fn backend(&self) -> Backend {
            Backend::Process
        }

        async fn invoke(
            &self,
            invocation: &Invocation,
            progress: &dyn ProgressSink,
            _cancel: &CancellationToken,
        ) -> std::result::Result<InvocationOutcome, EngineError> {
            self.seen.lock().push(invocation.args.clone());
            let step = self.steps.lock().remove(0);
            progress.report(0.5);
            let (exit, output_len) = match step {
                Step::Fail => (ExitState::Failed { code: Some(1) }, 0),
                Step::Empty => (ExitState::Success, 0),
                Step::Write(n) => {
                    std::fs::write(&invocation.output, vec![0u8; n])?;
                    (ExitState::Success, n as u64)
                }
                Step::Unavailable => {
                    return Err(EngineError::unavailable(Backend::Process, "not installed"))
                }
            };
            Ok(InvocationOutcome {
                exit,
                output_len,
                diagnostics: "Invalid data found when processing input".to_string(),
                elapsed: Duration::from_millis(1),
            })
        }
    }

    fn store(dir: &tempfile::TempDir) -> Arc<ArtifactStore> {
        Arc::new(ArtifactStore::new(ArtifactRoots::under(dir.path()), ExpiryPolicy::default()).unwrap())
    }

    fn chain3() -> Vec<TranscodeStrategy> {
        vec![
            TranscodeStrategy::new("a", ["-c", "copy"]),
            TranscodeStrategy::new("b", ["-c:v", "libx264"]),
            TranscodeStrategy::new("c", ["-crf", "23"]),
        ]
    }

    #[tokio::test]
    async fn falls_back_until_a_strategy_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let engine = Arc::new(Scripted::new(vec![Step::Fail, Step::Empty, Step::Write(64)]));
        let chain = StrategyChain::new(engine.clone(), store.clone());
        let reporter = ProgressReporter::new(3);
        let job = JobId::new();

        let ok = chain
            .run(dir.path(), &chain3(), &reporter, &CancellationToken::new(), Some(job))
            .await
            .unwrap();

        assert_eq!(ok.strategy, "c");
        assert_eq!(ok.attempts, 3);
        assert_eq!(reporter.current().transitions, 3);
        assert_eq!(engine.seen.lock()[1], ["-c:v", "libx264"]);
        // Only the successful output is left.
        assert_eq!(store.owned_by(job).len(), 1);
        assert_eq!(std::fs::metadata(&ok.output.path).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn exhausted_chain_carries_last_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let engine = Arc::new(Scripted::new(vec![Step::Fail, Step::Fail, Step::Empty]));
        let chain = StrategyChain::new(engine, store.clone());
        let job = JobId::new();

        let err = chain
            .run(dir.path(), &chain3(), &ProgressReporter::new(3), &CancellationToken::new(), Some(job))
            .await
            .unwrap_err();

        match err {
            Error::StrategyExhausted { attempts, detail } => {
                assert_eq!(attempts, 3);
                assert!(detail.starts_with("c: engine produced an empty output"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.owned_by(job).is_empty());
    }

    #[tokio::test]
    async fn unavailable_engine_stops_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let engine = Arc::new(Scripted::new(vec![Step::Unavailable, Step::Write(8), Step::Write(8)]));
        let chain = StrategyChain::new(engine.clone(), store.clone());

        let err = chain
            .run(dir.path(), &chain3(), &ProgressReporter::new(3), &CancellationToken::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::EnvironmentUnavailable { .. }));
        assert_eq!(engine.seen.lock().len(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_chain_is_exhausted_without_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let chain = StrategyChain::new(Arc::new(Scripted::new(vec![])), store(&dir));
        let err = chain
            .run(dir.path(), &[], &ProgressReporter::new(0), &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StrategyExhausted { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Scripted::new(vec![Step::Write(8)]));
        let chain = StrategyChain::new(engine.clone(), store(&dir));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = chain
            .run(dir.path(), &chain3(), &ProgressReporter::new(3), &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(engine.seen.lock().is_empty());
    }
}
