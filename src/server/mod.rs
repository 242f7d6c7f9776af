//! HTTP surface: upload, progress, result, download.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::conversion::{start_sweep_task, JobController};

pub mod error;
pub mod rate_limit;
pub mod routes;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppContext {
    pub controller: Arc<JobController>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(controller: Arc<JobController>, config: Arc<Config>) -> Self {
        Self {
            controller,
            config,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the public router: `/health`, the `/api` tree and optional
/// static assets, wrapped in the isolation headers browsers need.
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            HeaderName::from_static(routes::CALLER_HEADER),
        ]);

    let mut api = Router::new()
        .route("/health", get(routes::health))
        .route("/info", get(routes::info))
        .route("/convert", post(routes::convert))
        .route("/jobs/{id}", get(routes::get_job).delete(routes::cancel_job))
        .route("/jobs/{id}/result", get(routes::job_result))
        .route("/download/{artifact}", get(routes::download))
        .route("/accounts/{caller}", put(routes::put_account))
        .route("/events", get(routes::recent_events));

    if let Some(limiter) = rate_limit::limiter_from_config(&ctx.config.server.rate_limit) {
        api = api
            .layer(middleware::from_fn(rate_limit::rate_limit_middleware))
            .layer(Extension(limiter));
    }

    let static_dir = ctx.config.server.static_dir.clone();
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .nest("/api", api)
        .with_state(ctx);
    let app = match static_dir {
        Some(dir) if dir.is_dir() => with_frontend(app, &dir),
        _ => app,
    };

    // The in-browser engine needs a cross-origin isolated page.
    app.layer(SetResponseHeaderLayer::overriding(
        HeaderName::from_static("cross-origin-opener-policy"),
        HeaderValue::from_static("same-origin"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
        HeaderName::from_static("cross-origin-embedder-policy"),
        HeaderValue::from_static("require-corp"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("cross-origin"),
    ))
    .layer(cors)
    .layer(TraceLayer::new_for_http())
}

/// Unmatched paths fall through to the bundled frontend, with `index.html`
/// standing in for client-side routes.
fn with_frontend(app: Router, dir: &Path) -> Router {
    tracing::info!(dir = %dir.display(), "Serving frontend assets");
    let spa = ServeDir::new(dir)
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new(dir.join("index.html")));
    app.fallback_service(spa)
}

/// Start the HTTP server and the periodic sweep; returns after a shutdown
/// signal once in-flight requests have drained.
pub async fn start_server(config: Arc<Config>, controller: Arc<JobController>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let sweep_cancel = CancellationToken::new();
    let sweeper = start_sweep_task(
        controller.clone(),
        config.storage.sweep_interval(),
        sweep_cancel.clone(),
    );

    let app = create_router(AppContext::new(controller, config));

    tracing::info!(%addr, "HTTP listener starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep_cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Sweep task ended abnormally: {}", e);
    }

    tracing::info!("HTTP listener stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
