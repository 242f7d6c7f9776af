//! Route handlers for the HTTP API.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::error::AppError;
use super::AppContext;
use crate::accounts::Account;
use crate::conversion::{JobOutcome, SubmitRequest};
use crate::events::Event;
use webmforge_common::{media, ArtifactId, CallerId, Error, JobId, JobState, Plan};

/// Header carrying the caller key established by the outer layer.
pub const CALLER_HEADER: &str = "x-caller-id";

const DEFAULT_UPLOAD_NAME: &str = "upload";
const STREAM_CHUNK: usize = 64 * 1024;

type ApiResult<T> = Result<T, AppError>;

fn api_error(ctx: &AppContext, error: Error) -> AppError {
    AppError::new(error).expose_detail(ctx.config.server.expose_error_detail)
}

fn caller_from(headers: &HeaderMap) -> CallerId {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(CallerId::new)
        .unwrap_or_else(CallerId::anonymous)
}

// --- health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub backend: String,
    pub jobs: usize,
}

pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        backend: ctx.controller.engine().backend().to_string(),
        jobs: ctx.controller.jobs().len(),
    })
}

// --- info ---

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub features: Vec<&'static str>,
    pub accepted_media_type: String,
    pub accepted_extension: String,
    pub output_media_type: &'static str,
    pub max_file_size: u64,
    /// Per-plan ceiling in bytes; `null` means the upload ceiling applies.
    pub limits: BTreeMap<&'static str, Option<u64>>,
    pub strategies: Vec<String>,
    pub download_ttl_secs: u64,
}

pub async fn info(State(ctx): State<AppContext>) -> Json<InfoResponse> {
    let cfg = &ctx.config;
    let limits = Plan::ALL
        .iter()
        .map(|plan| (plan.as_str(), cfg.limits.plan_limit(*plan)))
        .collect();

    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        features: vec!["webm-to-mp4", "strategy-fallback", "progress", "cancellation"],
        accepted_media_type: cfg.upload.accepted_media_type.clone(),
        accepted_extension: cfg.upload.accepted_extension.clone(),
        output_media_type: media::MP4_MEDIA_TYPE,
        max_file_size: cfg.upload.max_file_size,
        limits,
        strategies: ctx
            .controller
            .strategies()
            .iter()
            .map(|s| s.name().to_string())
            .collect(),
        download_ttl_secs: cfg.storage.download_ttl_secs,
    })
}

// --- convert ---

#[derive(Debug, Deserialize)]
pub struct ConvertParams {
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConvertResponse {
    pub job_id: JobId,
    pub status_url: String,
    pub result_url: String,
}

/// Accept a raw upload. The ceiling is checked against `content-length`
/// before the body is read.
pub async fn convert(
    State(ctx): State<AppContext>,
    Query(params): Query<ConvertParams>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<(StatusCode, Json<ConvertResponse>)> {
    let caller = caller_from(&headers);
    let ceiling = ctx.controller.size_ceiling(&caller);

    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(size) = declared_size.filter(|size| *size > ceiling) {
        return Err(api_error(
            &ctx,
            Error::validation(format!("file size {size} bytes exceeds the {ceiling} byte limit")),
        ));
    }

    let limit = usize::try_from(ceiling).unwrap_or(usize::MAX);
    let bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
        api_error(&ctx, Error::validation(format!("upload rejected: {e}")))
    })?;

    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let name = params
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());

    let mut request = SubmitRequest::new(bytes, name, caller);
    if let Some(size) = declared_size {
        request = request.declared_size(size);
    }
    if let Some(media_type) = media_type {
        request = request.media_type(media_type);
    }

    let handle = ctx
        .controller
        .submit(request)
        .await
        .map_err(|e| api_error(&ctx, e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ConvertResponse {
            job_id: handle.id,
            status_url: format!("/api/jobs/{}", handle.id),
            result_url: format!("/api/jobs/{}/result", handle.id),
        }),
    ))
}

// --- jobs ---

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub id: JobId,
    pub caller: CallerId,
    pub file_name: String,
    pub size: u64,
    #[serde(flatten)]
    pub state: JobState,
    pub phase: String,
    pub progress: f64,
    pub percent: u8,
    pub strategy_index: Option<usize>,
    pub strategy_count: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = ctx.controller.job(id).map_err(|e| api_error(&ctx, e))?;
    let progress = ctx.controller.progress(id).map_err(|e| api_error(&ctx, e))?;

    Ok(Json(JobStatusResponse {
        id: job.id,
        caller: job.caller,
        file_name: job.source.name,
        size: job.source.size,
        state: progress.state,
        percent: progress.percent(),
        phase: progress.phase,
        progress: progress.ratio,
        strategy_index: progress.strategy_index,
        strategy_count: progress.strategy_count,
        created_at: job.created_at,
        finished_at: job.finished_at,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<JobOutcome> for ResultResponse {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded {
                artifact,
                strategy_used,
            } => Self {
                success: true,
                download_url: Some(format!("/api/download/{}", artifact.id)),
                file_name: Some(artifact.file_name),
                size: Some(artifact.size),
                expires_at: Some(artifact.expires_at),
                strategy_used: Some(strategy_used),
                reason: None,
                detail: None,
            },
            JobOutcome::Failed { reason, detail } => Self {
                success: false,
                download_url: None,
                file_name: None,
                size: None,
                expires_at: None,
                strategy_used: None,
                reason: Some(reason.to_string()),
                detail: Some(detail),
            },
        }
    }
}

/// Long-poll until the job is terminal.
pub async fn job_result(
    State(ctx): State<AppContext>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<ResultResponse>> {
    let outcome = ctx
        .controller
        .await_result(id)
        .await
        .map_err(|e| api_error(&ctx, e))?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = ctx.controller.cancel(id).map_err(|e| api_error(&ctx, e))?;
    Ok(Json(CancelResponse { cancelled }))
}

// --- download ---

pub async fn download(
    State(ctx): State<AppContext>,
    Path(id): Path<ArtifactId>,
) -> ApiResult<Response> {
    let resolved = ctx
        .controller
        .store()
        .resolve(id)
        .ok_or_else(|| api_error(&ctx, Error::not_found("download", id)))?;

    let file = tokio::fs::File::open(&resolved.path)
        .await
        .map_err(|_| api_error(&ctx, Error::not_found("download", id)))?;
    let body = Body::from_stream(ReaderStream::with_capacity(file, STREAM_CHUNK));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE.as_str(), media::MP4_MEDIA_TYPE.to_string()),
            (header::CONTENT_LENGTH.as_str(), resolved.size.to_string()),
            (
                header::CONTENT_DISPOSITION.as_str(),
                format!("attachment; filename=\"{}\"", resolved.file_name.replace('"', "")),
            ),
        ],
        body,
    )
        .into_response())
}

// --- accounts ---

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    pub plan: Plan,
}

pub async fn put_account(
    State(ctx): State<AppContext>,
    Path(caller): Path<String>,
    Json(req): Json<UpdateAccountRequest>,
) -> Json<Account> {
    let account = Account::new(CallerId::new(caller), req.plan);
    Json(ctx.controller.accounts().upsert(account))
}

// --- events ---

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

fn default_events_limit() -> usize {
    50
}

pub async fn recent_events(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsParams>,
) -> Json<Vec<Event>> {
    Json(ctx.controller.events().recent(params.limit))
}
