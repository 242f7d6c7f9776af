//! Governor-based rate limiting for `/api`.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use webmforge_common::Error;

use super::error::AppError;
use crate::config::RateLimitConfig;

/// A shared rate limiter instance.
pub type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// `requests` per `window`, replenished evenly, with the whole allowance
/// available as a burst.
pub fn create_limiter(requests: u32, window: Duration) -> SharedLimiter {
    let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
    let period = window / burst.get();
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst);
    Arc::new(RateLimiter::direct(quota))
}

pub fn limiter_from_config(cfg: &RateLimitConfig) -> Option<SharedLimiter> {
    cfg.enabled
        .then(|| create_limiter(cfg.requests, Duration::from_secs(cfg.window_secs)))
}

/// Rejects requests over quota with a 429 in the usual JSON error shape.
pub async fn rate_limit_middleware(
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let limiter = request.extensions().get::<SharedLimiter>().cloned();

    if let Some(limiter) = limiter {
        if limiter.check().is_err() {
            tracing::debug!(path = %request.uri().path(), "Rate limit exceeded");
            return Err(AppError::new(Error::RateLimited).into_response());
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_the_window_allowance() {
        let limiter = create_limiter(3, Duration::from_secs(900));
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn zero_requests_still_allows_one() {
        let limiter = create_limiter(0, Duration::from_secs(60));
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn disabled_config_has_no_limiter() {
        let cfg = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        assert!(limiter_from_config(&cfg).is_none());
    }
}
