//! Job controller: one conversion request from upload to terminal outcome.
//!
//! `submit` validates and stages the input, then hands the job to a spawned
//! task that drives the [`StrategyChain`]. A caller may hold at most one
//! non-terminal job; the guard is an entry in `active` keyed by caller.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::chain::StrategyChain;
use super::progress::{ProgressReporter, ProgressSnapshot};
use super::strategy::{chain_from_config, TranscodeStrategy};
use crate::accounts::AccountStore;
use crate::artifacts::{to_chrono, ArtifactStore, DownloadHandle, StagedArtifact, SweepReport};
use crate::config::{Config, LimitsConfig, UploadConfig};
use crate::events::{EventBus, EventPayload};
use webmforge_common::{
    media, ArtifactRole, CallerId, Error, ErrorKind, JobId, JobState, Plan, Result,
    SourceDescriptor,
};
use webmforge_engine::TranscodeEngine;

/// An upload as received from the outer layer.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub bytes: Bytes,
    pub declared_name: String,
    pub declared_size: u64,
    pub declared_media_type: Option<String>,
    pub caller: CallerId,
}

impl SubmitRequest {
    /// Request whose declared size is the byte length.
    pub fn new(bytes: impl Into<Bytes>, declared_name: impl Into<String>, caller: CallerId) -> Self {
        let bytes = bytes.into();
        Self {
            declared_size: bytes.len() as u64,
            bytes,
            declared_name: declared_name.into(),
            declared_media_type: None,
            caller,
        }
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.declared_media_type = Some(media_type.into());
        self
    }

    pub fn declared_size(mut self, size: u64) -> Self {
        self.declared_size = size;
        self
    }
}

/// Retrievable reference to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobHandle {
    pub id: JobId,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        artifact: DownloadHandle,
        strategy_used: String,
    },
    Failed {
        reason: ErrorKind,
        detail: String,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

/// Snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionJob {
    pub id: JobId,
    pub caller: CallerId,
    pub source: SourceDescriptor,
    pub state: JobState,
    pub active_strategy_index: Option<usize>,
    pub progress_ratio: f64,
    pub phase: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobOutcome>,
}

/// What one controller sweep reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub artifacts: SweepReport,
    pub jobs_pruned: usize,
}

struct JobEntry {
    id: JobId,
    caller: CallerId,
    source: SourceDescriptor,
    created_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    reporter: ProgressReporter,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<JobOutcome>>,
}

impl JobEntry {
    fn is_terminal(&self) -> bool {
        self.reporter.current().state.is_terminal()
    }

    fn snapshot(&self) -> ConversionJob {
        let progress = self.reporter.current();
        ConversionJob {
            id: self.id,
            caller: self.caller.clone(),
            source: self.source.clone(),
            state: progress.state,
            active_strategy_index: progress.strategy_index,
            progress_ratio: progress.ratio,
            phase: progress.phase,
            created_at: self.created_at,
            finished_at: *self.finished_at.lock(),
            result: self.outcome.borrow().clone(),
        }
    }
}

struct Settings {
    upload: UploadConfig,
    limits: LimitsConfig,
    expose_error_detail: bool,
    job_retention: Duration,
}

pub struct JobController {
    chain: StrategyChain,
    store: Arc<ArtifactStore>,
    accounts: Arc<dyn AccountStore>,
    events: Arc<EventBus>,
    strategies: Arc<[TranscodeStrategy]>,
    jobs: DashMap<JobId, Arc<JobEntry>>,
    active: DashMap<CallerId, JobId>,
    settings: Settings,
}

impl JobController {
    pub fn new(
        config: &Config,
        engine: Arc<dyn TranscodeEngine>,
        store: Arc<ArtifactStore>,
        accounts: Arc<dyn AccountStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let chain = StrategyChain::new(engine, store.clone()).with_events(events.clone());
        Self {
            chain,
            store,
            accounts,
            events,
            strategies: chain_from_config(&config.strategies).into(),
            jobs: DashMap::new(),
            active: DashMap::new(),
            settings: Settings {
                upload: config.upload.clone(),
                limits: config.limits.clone(),
                expose_error_detail: config.server.expose_error_detail,
                job_retention: config.storage.max_age(),
            },
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    pub fn strategies(&self) -> &[TranscodeStrategy] {
        &self.strategies
    }

    pub fn engine(&self) -> &Arc<dyn TranscodeEngine> {
        self.chain.engine()
    }

    /// Plan the caller is on; unknown callers get the default plan.
    pub fn plan_for(&self, caller: &CallerId) -> Plan {
        self.accounts
            .find_by_key(caller)
            .map(|account| account.plan)
            .unwrap_or(self.settings.limits.default_plan)
    }

    /// Largest input the caller may submit, in bytes.
    pub fn size_ceiling(&self, caller: &CallerId) -> u64 {
        let max = self.settings.upload.max_file_size;
        self.settings
            .limits
            .plan_limit(self.plan_for(caller))
            .map_or(max, |limit| limit.min(max))
    }

    /// Validate, stage and start a conversion.
    ///
    /// Media type and size are checked before anything is registered. The
    /// job then exists in `Validating` while its content is inspected, and
    /// moves to `Staged` once the input is persisted.
    ///
    /// # Errors
    ///
    /// `Validation` for a rejected input and `Busy` when the caller already
    /// has a running job; neither leaves any state behind. `StorageFull` or
    /// `Io` when the input could not be staged.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<JobHandle> {
        let SubmitRequest {
            bytes,
            declared_name,
            declared_size,
            declared_media_type,
            caller,
        } = request;

        self.validate(&bytes, &declared_name, declared_size, declared_media_type.as_deref(), &caller)?;

        let id = JobId::new();
        self.acquire_guard(&caller, id)?;

        let reporter = ProgressReporter::new(self.strategies.len()).with_events(self.events.clone(), id);
        reporter.set_state(JobState::Validating);
        let (outcome, _) = watch::channel(None);
        let entry = Arc::new(JobEntry {
            id,
            caller: caller.clone(),
            source: SourceDescriptor {
                name: declared_name,
                size: declared_size,
                media_type: declared_media_type,
            },
            created_at: Utc::now(),
            finished_at: Mutex::new(None),
            reporter,
            cancel: CancellationToken::new(),
            outcome,
        });
        self.jobs.insert(id, entry.clone());

        if let Err(e) = self.inspect_content(&bytes) {
            self.abandon(id, &caller);
            tracing::debug!(caller = %caller, error = %e, "Rejected upload content");
            return Err(e);
        }

        let input = match self
            .store
            .stage(&bytes, ArtifactRole::Input, Some(id), &format!(".{}", media::WEBM_EXTENSION))
            .await
        {
            Ok(input) => input,
            Err(e) => {
                self.abandon(id, &caller);
                tracing::error!(job_id = %id, caller = %caller, error = %e, "Failed to stage input");
                return Err(e);
            }
        };
        entry.reporter.set_state(JobState::Staged);

        tracing::info!(
            job_id = %id,
            caller = %caller,
            name = %entry.source.name,
            size = entry.source.size,
            "Conversion submitted"
        );
        self.events.publish(EventPayload::ConversionSubmitted {
            job_id: id,
            caller: caller.clone(),
            size: entry.source.size,
        });

        let span = tracing::info_span!("conversion", job_id = %id, caller = %caller);
        tokio::spawn(self.clone().run_job(entry, input).instrument(span));

        Ok(JobHandle { id })
    }

    /// Latest progress. Never blocks.
    pub fn progress(&self, id: JobId) -> Result<ProgressSnapshot> {
        Ok(self.entry(id)?.reporter.current())
    }

    /// Wait for the job's terminal outcome.
    pub async fn await_result(&self, id: JobId) -> Result<JobOutcome> {
        let entry = self.entry(id)?;
        let mut rx = entry.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| Error::Internal(format!("job outcome channel closed: {e}")))?;
        outcome
            .clone()
            .ok_or_else(|| Error::Internal("job finished without an outcome".to_string()))
    }

    /// Request cancellation of a running job.
    ///
    /// Returns false when the job had already finished. The job reaches
    /// `Failed` with reason `Cancelled` once the active attempt stops.
    pub fn cancel(&self, id: JobId) -> Result<bool> {
        let entry = self.entry(id)?;
        if entry.is_terminal() {
            return Ok(false);
        }
        entry.cancel.cancel();
        tracing::info!(job_id = %id, "Cancellation requested");
        Ok(true)
    }

    pub fn job(&self, id: JobId) -> Result<ConversionJob> {
        Ok(self.entry(id)?.snapshot())
    }

    /// Snapshots of every retained job, newest first.
    pub fn jobs(&self) -> Vec<ConversionJob> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|e| e.snapshot()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Job the caller is currently running, if any.
    pub fn active_job(&self, caller: &CallerId) -> Option<JobId> {
        let id = *self.active.get(caller)?;
        self.is_live(id).then_some(id)
    }

    /// Reclaim expired artifacts and forget terminal jobs older than the
    /// artifact age limit.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepSummary {
        let artifacts = self.store.sweep(now);

        let retention = to_chrono(self.settings.job_retention);
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| match *entry.finished_at.lock() {
            Some(finished) => now - finished <= retention,
            None => true,
        });
        let jobs_pruned = before.saturating_sub(self.jobs.len());

        let summary = SweepSummary {
            artifacts,
            jobs_pruned,
        };
        if artifacts.total() > 0 || jobs_pruned > 0 {
            tracing::info!(
                expired = artifacts.expired,
                orphaned = artifacts.orphaned,
                jobs_pruned,
                "Sweep reclaimed resources"
            );
            self.events.publish(EventPayload::ArtifactsSwept {
                expired: artifacts.expired,
                orphaned: artifacts.orphaned,
                jobs_pruned,
            });
        }
        summary
    }

    fn entry(&self, id: JobId) -> Result<Arc<JobEntry>> {
        self.jobs
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// A job still in flight. A guard whose job is not yet registered
    /// belongs to a submission that is still staging.
    fn is_live(&self, id: JobId) -> bool {
        self.jobs.get(&id).map_or(true, |entry| !entry.is_terminal())
    }

    fn acquire_guard(&self, caller: &CallerId, id: JobId) -> Result<()> {
        match self.active.entry(caller.clone()) {
            Entry::Occupied(mut held) => {
                if self.is_live(*held.get()) {
                    tracing::debug!(caller = %caller, active = %held.get(), "Rejected concurrent submission");
                    return Err(Error::Busy {
                        caller: caller.to_string(),
                    });
                }
                held.insert(id);
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        Ok(())
    }

    fn validate(
        &self,
        bytes: &[u8],
        name: &str,
        declared_size: u64,
        media_type: Option<&str>,
        caller: &CallerId,
    ) -> Result<()> {
        let upload = &self.settings.upload;

        if bytes.is_empty() {
            return Err(Error::validation("the upload is empty"));
        }

        let type_ok = media_type.is_some_and(|t| media_type_matches(t, &upload.accepted_media_type));
        if !type_ok && !extension_matches(name, &upload.accepted_extension) {
            return Err(Error::validation(format!(
                "only {} files are accepted",
                upload.accepted_media_type
            )));
        }

        let ceiling = self.size_ceiling(caller);
        let size = declared_size.max(bytes.len() as u64);
        if size > ceiling {
            return Err(Error::validation(format!(
                "file size {size} bytes exceeds the {ceiling} byte limit for the {} plan",
                self.plan_for(caller)
            )));
        }

        if declared_size != bytes.len() as u64 {
            return Err(Error::validation(format!(
                "declared size {declared_size} does not match the {} bytes received",
                bytes.len()
            )));
        }

        Ok(())
    }

    /// Content check run while the job is `Validating`.
    fn inspect_content(&self, bytes: &[u8]) -> Result<()> {
        if self.settings.upload.sniff_content && !media::has_ebml_magic(bytes) {
            return Err(Error::validation("the upload is not a WebM container"));
        }
        Ok(())
    }

    /// Undo a registration that never reached `Staged`.
    fn abandon(&self, id: JobId, caller: &CallerId) {
        self.jobs.remove(&id);
        self.active.remove_if(caller, |_, held| *held == id);
    }

    async fn run_job(self: Arc<Self>, entry: Arc<JobEntry>, input: StagedArtifact) {
        let _unfinished = Unfinished {
            controller: self.clone(),
            entry: entry.clone(),
        };

        let result = self
            .chain
            .run(&input.path, &self.strategies, &entry.reporter, &entry.cancel, Some(entry.id))
            .await;

        self.store.release(input.id);

        let outcome = match result {
            Ok(success) => {
                let download_name = media::output_name_for(&entry.source.name);
                match self.store.publish(success.output.id, download_name) {
                    Ok(artifact) => JobOutcome::Succeeded {
                        artifact,
                        strategy_used: success.strategy,
                    },
                    Err(e) => {
                        self.store.release(success.output.id);
                        self.failure(&e)
                    }
                }
            }
            Err(e) => self.failure(&e),
        };

        self.finish(&entry, outcome);
    }

    /// Release whatever the job still owns, record the outcome and free the
    /// caller's slot.
    fn finish(&self, entry: &JobEntry, outcome: JobOutcome) {
        let leftovers = self.store.release_owned_by(entry.id);
        if leftovers > 0 {
            tracing::debug!(count = leftovers, "Released leftover artifacts");
        }

        match &outcome {
            JobOutcome::Succeeded {
                artifact,
                strategy_used,
            } => {
                entry.reporter.finish_success(strategy_used);
                tracing::info!(strategy = %strategy_used, artifact = %artifact.id, size = artifact.size, "Conversion succeeded");
                self.events.publish(EventPayload::ConversionSucceeded {
                    job_id: entry.id,
                    strategy: strategy_used.clone(),
                    artifact_id: artifact.id,
                });
            }
            JobOutcome::Failed { reason, detail } => {
                entry.reporter.finish_failure(format!("failed: {reason}"));
                tracing::warn!(reason = %reason, detail = %detail, "Conversion failed");
                self.events.publish(EventPayload::ConversionFailed {
                    job_id: entry.id,
                    reason: *reason,
                });
            }
        }

        *entry.finished_at.lock() = Some(Utc::now());
        self.active.remove_if(&entry.caller, |_, held| *held == entry.id);
        entry.outcome.send_replace(Some(outcome));
    }

    fn failure(&self, error: &Error) -> JobOutcome {
        let reason = error.kind();
        let detail = if self.settings.expose_error_detail {
            error.to_string()
        } else {
            reason.generic_message().to_string()
        };
        JobOutcome::Failed { reason, detail }
    }
}

/// Finishes a job whose task unwound or was dropped before reaching an
/// outcome, so the caller's slot is freed and waiters wake up.
struct Unfinished {
    controller: Arc<JobController>,
    entry: Arc<JobEntry>,
}

impl Drop for Unfinished {
    fn drop(&mut self) {
        if self.entry.outcome.borrow().is_some() {
            return;
        }
        tracing::error!(job_id = %self.entry.id, "Conversion task ended without an outcome");
        let outcome = self
            .controller
            .failure(&Error::Internal("conversion task ended without an outcome".to_string()));
        self.controller.finish(&self.entry, outcome);
    }
}

/// Run [`JobController::sweep`] every `interval` until `cancel` fires.
pub fn start_sweep_task(
    controller: Arc<JobController>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let controller = controller.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || controller.sweep(Utc::now())).await {
                tracing::error!(error = %e, "Sweep task panicked");
            }
        }
        tracing::debug!("Sweep task stopped");
    })
}

fn media_type_matches(declared: &str, accepted: &str) -> bool {
    let essence = declared.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case(accepted)
}

fn extension_matches(name: &str, accepted: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(accepted.trim_start_matches('.')))
}
