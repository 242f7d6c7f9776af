//! Job controller integration tests.
//!
//! Drives submissions end to end against a scripted [`FakeEngine`] and
//! checks job outcomes, progress and artifact cleanup.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;

use common::{webm_bytes, webm_request, Step, TestHarness, MB};
use webmforge::config::Config;
use webmforge::conversion::{JobOutcome, SubmitRequest};
use webmforge::events::EventPayload;
use webmforge_common::{CallerId, Error, ErrorKind, JobState, Plan};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wrong_media_type_is_rejected_without_side_effects() {
    let h = TestHarness::new([Step::Succeed(16)]);

    let request = SubmitRequest::new(webm_bytes(1024), "clip.mp4", CallerId::new("alice")).media_type("video/mp4");
    let err = h.controller.submit(request).await.unwrap_err();

    assert_matches!(err, Error::Validation(_));
    assert!(h.controller.jobs().is_empty());
    assert!(h.store().is_empty());
    assert_eq!(h.upload_files(), 0);
    assert_eq!(h.engine.attempts(), 0);
}

#[tokio::test]
async fn extension_alone_is_accepted() {
    let h = TestHarness::new([Step::Succeed(16)]);
    let request = SubmitRequest::new(webm_bytes(1024), "clip.webm", CallerId::new("alice"));
    let handle = h.controller.submit(request).await.unwrap();
    assert!(h.controller.await_result(handle.id).await.unwrap().is_success());
}

#[tokio::test]
async fn content_without_webm_header_is_rejected() {
    let h = TestHarness::new([]);
    let request =
        SubmitRequest::new(vec![0u8; 128], "clip.webm", CallerId::new("alice")).media_type("video/webm");
    assert_matches!(h.controller.submit(request).await, Err(Error::Validation(_)));
    assert!(h.store().is_empty());
}

#[tokio::test]
async fn content_rejection_frees_the_caller_slot() {
    let h = TestHarness::new([Step::Succeed(8)]);
    let request =
        SubmitRequest::new(vec![0u8; 128], "clip.webm", CallerId::new("alice")).media_type("video/webm");
    assert_matches!(h.controller.submit(request).await, Err(Error::Validation(_)));

    assert!(h.controller.jobs().is_empty());
    assert_eq!(h.controller.active_job(&CallerId::new("alice")), None);
    assert_eq!(h.upload_files(), 0);

    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    assert!(h.controller.await_result(handle.id).await.unwrap().is_success());
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let h = TestHarness::new([]);
    let request = SubmitRequest::new(Vec::new(), "clip.webm", CallerId::new("alice")).media_type("video/webm");
    assert_matches!(h.controller.submit(request).await, Err(Error::Validation(_)));
}

#[tokio::test]
async fn declared_size_must_match_received_bytes() {
    let h = TestHarness::new([]);
    let request = webm_request(1024, "alice").declared_size(2048);
    assert_matches!(h.controller.submit(request).await, Err(Error::Validation(_)));
    assert!(h.controller.jobs().is_empty());
}

#[tokio::test]
async fn oversize_for_default_plan_is_rejected() {
    let h = TestHarness::new([Step::Succeed(16)]);
    // Free plan: 50 MB.
    let request = webm_request(1024, "alice").declared_size(60 * MB as u64);
    let err = h.controller.submit(request).await.unwrap_err();

    assert_matches!(err, Error::Validation(ref msg) if msg.contains("free"));
    assert!(h.controller.jobs().is_empty());
    assert_eq!(h.upload_files(), 0);
}

#[tokio::test]
async fn e2e_600mb_under_500mb_ceiling_is_rejected() {
    let h = TestHarness::new([Step::Succeed(16)]);
    h.set_plan("bob", Plan::Pro);
    assert_eq!(h.controller.size_ceiling(&CallerId::new("bob")), 500 * MB as u64);

    let request = webm_request(4096, "bob").declared_size(600 * MB as u64);
    assert_matches!(h.controller.submit(request).await, Err(Error::Validation(_)));
    assert!(h.store().is_empty());
    assert_eq!(h.upload_files(), 0);
    assert_eq!(h.output_files(), 0);
}

#[tokio::test]
async fn enterprise_plan_is_bounded_by_upload_ceiling() {
    let mut config = Config::default();
    config.upload.max_file_size = 2 * MB as u64;
    let h = TestHarness::with_config(config, []);
    h.set_plan("carol", Plan::Enterprise);
    assert_eq!(h.controller.size_ceiling(&CallerId::new("carol")), 2 * MB as u64);
}

// ---------------------------------------------------------------------------
// Single-flight guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_submission_while_running_is_busy() {
    let h = TestHarness::new([Step::Hang]);
    let first = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    h.wait_for_state(first.id, |s| matches!(s, JobState::Converting { .. })).await;

    let err = h.controller.submit(webm_request(1024, "alice")).await.unwrap_err();
    assert_matches!(err, Error::Busy { .. });

    // The first job is untouched and is the only one.
    assert_eq!(h.controller.jobs().len(), 1);
    assert_eq!(
        h.controller.progress(first.id).unwrap().state,
        JobState::Converting { strategy_index: 0 }
    );
    assert_eq!(h.controller.active_job(&CallerId::new("alice")), Some(first.id));

    // Other callers are independent.
    h.engine.push(Step::Succeed(8));
    let other = h.controller.submit(webm_request(1024, "bob")).await.unwrap();
    assert!(h.controller.await_result(other.id).await.unwrap().is_success());

    assert!(h.controller.cancel(first.id).unwrap());
    h.controller.await_result(first.id).await.unwrap();
}

#[tokio::test]
async fn crashed_conversion_fails_and_frees_the_caller() {
    let h = TestHarness::new([Step::Panic]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), h.controller.await_result(handle.id))
        .await
        .expect("waiters must wake up after a crash")
        .unwrap();
    assert_matches!(outcome, JobOutcome::Failed { reason: ErrorKind::Internal, .. });
    assert_eq!(h.controller.progress(handle.id).unwrap().state, JobState::Failed);
    assert_eq!(h.upload_files(), 0);
    assert_eq!(h.output_files(), 0);
    assert_eq!(h.controller.active_job(&CallerId::new("alice")), None);

    h.engine.push(Step::Succeed(8));
    let next = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    assert!(h.controller.await_result(next.id).await.unwrap().is_success());
}

#[tokio::test]
async fn guard_is_released_after_terminal_outcome() {
    let h = TestHarness::new([Step::Fail, Step::Fail, Step::Fail, Step::Succeed(8)]);
    let first = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    assert!(!h.controller.await_result(first.id).await.unwrap().is_success());
    assert_eq!(h.controller.active_job(&CallerId::new("alice")), None);

    let second = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    assert!(h.controller.await_result(second.id).await.unwrap().is_success());
}

// ---------------------------------------------------------------------------
// Strategy chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn only_third_strategy_succeeds() {
    let h = TestHarness::new([Step::Fail, Step::Fail, Step::Succeed(2048)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();

    let outcome = h.controller.await_result(handle.id).await.unwrap();
    assert_matches!(
        outcome,
        JobOutcome::Succeeded { ref strategy_used, ref artifact }
            if strategy_used == "compatibility re-encode" && artifact.size == 2048
    );

    let progress = h.controller.progress(handle.id).unwrap();
    assert_eq!(progress.transitions, 3);
    assert_eq!(progress.ratio, 1.0);
    assert_eq!(progress.state, JobState::Succeeded);

    let seen = h.engine.seen();
    assert_eq!(seen[0].args, ["-c", "copy"]);
    assert_eq!(seen[1].args[..2], ["-c:v", "libx264"]);
    assert!(seen[2].args.contains(&"+faststart".to_string()));
    assert!(seen.iter().all(|s| s.input_existed));
}

#[tokio::test]
async fn healthy_exit_with_empty_output_is_a_failure() {
    let h = TestHarness::new([Step::Empty, Step::Succeed(64)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();

    let outcome = h.controller.await_result(handle.id).await.unwrap();
    assert_matches!(outcome, JobOutcome::Succeeded { ref strategy_used, .. } if strategy_used == "fast re-encode");
    assert_eq!(h.engine.attempts(), 2);
}

#[tokio::test]
async fn e2e_stream_copy_fails_fast_reencode_succeeds() {
    let h = TestHarness::new([Step::Fail, Step::Succeed(4 * MB)]);
    let handle = h.controller.submit(webm_request(10 * MB, "alice")).await.unwrap();

    let outcome = h.controller.await_result(handle.id).await.unwrap();
    let input_path = h.engine.seen()[0].input.clone();
    let artifact = match outcome {
        JobOutcome::Succeeded {
            artifact,
            strategy_used,
        } => {
            assert_eq!(strategy_used, "fast re-encode");
            artifact
        }
        other => panic!("unexpected outcome: {other:?}"),
    };

    assert!(!input_path.exists());
    assert_eq!(h.upload_files(), 0);
    assert_eq!(artifact.file_name, "clip.mp4");

    // Only the published output remains.
    let tracked = h.store().tracked();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].id, artifact.id);
    assert!(tracked[0].is_published());
    assert_eq!(h.output_files(), 1);
    assert!(h.store().resolve(artifact.id).is_some());
}

#[tokio::test]
async fn e2e_all_strategies_fail() {
    let h = TestHarness::new([Step::Fail, Step::Empty, Step::Fail]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();

    let outcome = h.controller.await_result(handle.id).await.unwrap();
    assert_matches!(
        outcome,
        JobOutcome::Failed { reason: ErrorKind::StrategyExhausted, ref detail }
            if detail == ErrorKind::StrategyExhausted.generic_message()
    );

    assert!(h.store().is_empty());
    assert_eq!(h.upload_files(), 0);
    assert_eq!(h.output_files(), 0);

    let progress = h.controller.progress(handle.id).unwrap();
    assert_eq!(progress.state, JobState::Failed);
    assert_eq!(progress.ratio, 0.5);
}

#[tokio::test]
async fn exposed_detail_carries_last_diagnostic() {
    let mut config = Config::default();
    config.server.expose_error_detail = true;
    let h = TestHarness::with_config(config, [Step::Fail, Step::Fail, Step::Fail]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();

    match h.controller.await_result(handle.id).await.unwrap() {
        JobOutcome::Failed { detail, .. } => {
            assert!(detail.contains("compatibility re-encode"), "{detail}");
            assert!(detail.contains("codec not currently supported"), "{detail}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn unavailable_backend_fails_without_trying_other_strategies() {
    let h = TestHarness::new([Step::Unavailable, Step::Succeed(8)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();

    let outcome = h.controller.await_result(handle.id).await.unwrap();
    assert_matches!(outcome, JobOutcome::Failed { reason: ErrorKind::EnvironmentUnavailable, .. });
    assert_eq!(h.engine.attempts(), 1);
    assert!(h.store().is_empty());
}

#[tokio::test]
async fn single_strategy_chain_from_config() {
    let mut config = Config::default();
    config.strategies.truncate(1);
    let h = TestHarness::with_config(config, [Step::Fail, Step::Succeed(8)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();

    let outcome = h.controller.await_result(handle.id).await.unwrap();
    assert_matches!(outcome, JobOutcome::Failed { reason: ErrorKind::StrategyExhausted, .. });
    assert_eq!(h.engine.attempts(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_releases_artifacts_and_fails_job() {
    let h = TestHarness::new([Step::Hang]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    h.wait_for_state(handle.id, |s| matches!(s, JobState::Converting { .. })).await;

    assert!(h.controller.cancel(handle.id).unwrap());
    let outcome = h.controller.await_result(handle.id).await.unwrap();
    assert_matches!(outcome, JobOutcome::Failed { reason: ErrorKind::Cancelled, .. });

    assert!(h.store().is_empty());
    assert_eq!(h.upload_files(), 0);
    assert_eq!(h.output_files(), 0);
    // Cancelling a finished job is a no-op.
    assert!(!h.controller.cancel(handle.id).unwrap());
}

#[tokio::test]
async fn cancel_unknown_job_is_not_found() {
    let h = TestHarness::new([]);
    assert_matches!(
        h.controller.cancel(webmforge_common::JobId::new()),
        Err(Error::NotFound { .. })
    );
}

// ---------------------------------------------------------------------------
// Progress and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_is_readable_while_running() {
    let h = TestHarness::new([Step::SlowSucceed(Duration::from_millis(200), 8)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    h.wait_for_state(handle.id, |s| matches!(s, JobState::Converting { .. })).await;

    let progress = h.controller.progress(handle.id).unwrap();
    assert_eq!(progress.phase, "attempting strategy 1 of 3 (stream copy)");
    assert!(progress.ratio <= 0.5);

    h.controller.await_result(handle.id).await.unwrap();
    assert_eq!(h.controller.progress(handle.id).unwrap().ratio, 1.0);
}

#[tokio::test]
async fn lifecycle_events_are_recorded() {
    let h = TestHarness::new([Step::Fail, Step::Succeed(8)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    h.controller.await_result(handle.id).await.unwrap();

    let events = h.controller.events().recent(100);
    let kinds: Vec<&str> = events
        .iter()
        .rev()
        .filter_map(|e| match &e.payload {
            EventPayload::ConversionSubmitted { .. } => Some("submitted"),
            EventPayload::AttemptStarted { .. } => Some("attempt"),
            EventPayload::AttemptFailed { .. } => Some("attempt_failed"),
            EventPayload::ConversionSucceeded { .. } => Some("succeeded"),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, ["submitted", "attempt", "attempt_failed", "attempt", "succeeded"]);
}

#[tokio::test]
async fn job_snapshot_reports_source_and_result() {
    let h = TestHarness::new([Step::Succeed(8)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    h.controller.await_result(handle.id).await.unwrap();

    let job = h.controller.job(handle.id).unwrap();
    assert_eq!(job.source.name, "clip.webm");
    assert_eq!(job.source.size, 1024);
    assert_eq!(job.caller.as_str(), "alice");
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.finished_at.is_some());
    assert!(job.result.is_some_and(|r| r.is_success()));
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_reclaims_published_output_after_max_age() {
    let h = TestHarness::new([Step::Succeed(8)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    let artifact = match h.controller.await_result(handle.id).await.unwrap() {
        JobOutcome::Succeeded { artifact, .. } => artifact,
        other => panic!("unexpected outcome: {other:?}"),
    };

    // Nothing is due yet.
    let summary = h.controller.sweep(Utc::now());
    assert_eq!(summary.artifacts.total(), 0);
    assert_eq!(summary.jobs_pruned, 0);
    assert!(h.store().contains(artifact.id));

    let later = Utc::now() + chrono::Duration::hours(25);
    let summary = h.controller.sweep(later);
    assert_eq!(summary.artifacts.expired, 1);
    assert_eq!(summary.jobs_pruned, 1);
    assert!(!h.store().contains(artifact.id));
    assert_eq!(h.output_files(), 0);
    assert!(h.controller.job(handle.id).is_err());

    // Idempotent.
    let again = h.controller.sweep(later);
    assert_eq!(again.artifacts.total(), 0);
    assert_eq!(again.jobs_pruned, 0);
}

#[tokio::test]
async fn download_closes_after_ttl_but_file_lives_until_max_age() {
    let h = TestHarness::new([Step::Succeed(8)]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    let artifact = match h.controller.await_result(handle.id).await.unwrap() {
        JobOutcome::Succeeded { artifact, .. } => artifact,
        other => panic!("unexpected outcome: {other:?}"),
    };
    let created_at = h.store().get(artifact.id).unwrap().created_at;

    let after_ttl = created_at + chrono::Duration::minutes(61);
    assert!(h.store().resolve_at(artifact.id, after_ttl).is_none());
    assert_eq!(h.controller.sweep(after_ttl).artifacts.expired, 0);
    assert!(h.store().contains(artifact.id));
    assert_eq!(h.output_files(), 1);

    let after_max_age = created_at + chrono::Duration::hours(25);
    assert_eq!(h.controller.sweep(after_max_age).artifacts.expired, 1);
    assert_eq!(h.output_files(), 0);
}

#[tokio::test]
async fn sweep_never_touches_running_jobs() {
    let h = TestHarness::new([Step::Hang]);
    let handle = h.controller.submit(webm_request(1024, "alice")).await.unwrap();
    h.wait_for_state(handle.id, |s| matches!(s, JobState::Converting { .. })).await;

    let summary = h.controller.sweep(Utc::now());
    assert_eq!(summary.artifacts.total(), 0);
    assert_eq!(summary.jobs_pruned, 0);
    assert_eq!(h.upload_files(), 1);

    h.controller.cancel(handle.id).unwrap();
    h.controller.await_result(handle.id).await.unwrap();
}
