//! Error-to-HTTP response conversion.
//!
//! Route handlers return `Result<T, AppError>`; the body is
//! `{ "error", "code", "detail" }` where `error` is the generic
//! classification and `detail` the technical message (only when the
//! deployment exposes it).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use webmforge_common::Error;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: Error,
    expose_detail: bool,
}

impl AppError {
    pub fn new(inner: Error) -> Self {
        Self {
            inner,
            expose_detail: true,
        }
    }

    pub fn expose_detail(mut self, expose: bool) -> Self {
        self.expose_detail = expose;
        self
    }

    pub fn inner(&self) -> &Error {
        &self.inner
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.inner, "Server error in API handler");
        }

        let kind = self.inner.kind();
        // Validation and lookup messages describe the request, never the host.
        let client_facing = status.is_client_error() && !matches!(self.inner, Error::Io { .. });
        let detail = (self.expose_detail || client_facing).then(|| self.inner.to_string());

        let body = json!({
            "error": kind.generic_message(),
            "code": kind.as_str(),
            "detail": detail,
        });

        (status, axum::Json(body)).into_response()
    }
}
