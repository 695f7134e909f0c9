//! Sliding-window rate limiting.
//!
//! Two fixed 60-second windows per account combined by linear
//! interpolation over the elapsed fraction of the current window: O(1)
//! state per account, one KV round trip per admission. Infrastructure
//! failures admit the request; the limiter never fails closed.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    api_types::ErrorResponse,
    cache::{Cache, CacheKeys, CacheResult},
    models::RequestContext,
};

const WINDOW_SECS: u64 = 60;
/// Current + previous window must both survive until the next rollover.
const WINDOW_TTL_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: u64,
    pub estimated: i64,
}

/// The pure half of the limiter: weight the previous window by the
/// remaining fraction of the current one and add the current count.
pub fn decide(prev: i64, curr: i64, limit: u32, now_secs: u64) -> RateLimitDecision {
    let window = now_secs / WINDOW_SECS;
    let progress = (now_secs % WINDOW_SECS) as f64 / WINDOW_SECS as f64;
    let estimated = (prev as f64 * (1.0 - progress) + curr as f64).floor() as i64;
    let allowed = estimated <= i64::from(limit);
    RateLimitDecision {
        allowed,
        limit,
        remaining: if allowed {
            (i64::from(limit) - estimated).max(0) as u32
        } else {
            0
        },
        reset_at: (window + 1) * WINDOW_SECS,
        estimated,
    }
}

/// One admission check: read the previous window, count this request in
/// the current one, and roll the increment back if the estimate lands
/// over the limit.
pub async fn check_and_increment(
    cache: &Cache,
    account_id: i64,
    limit: u32,
) -> CacheResult<RateLimitDecision> {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let window = now_secs / WINDOW_SECS;
    let curr_key = CacheKeys::rate_window(account_id, window);
    let prev_key = CacheKeys::rate_window(account_id, window.saturating_sub(1));

    let (prev, curr) = cache
        .window_read_and_incr(&prev_key, &curr_key, WINDOW_TTL_SECS)
        .await?;
    let decision = decide(prev, curr, limit, now_secs);

    if !decision.allowed {
        cache.decr(&curr_key).await?;
    }
    Ok(decision)
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let context = request
        .extensions()
        .get::<std::sync::Arc<RequestContext>>()
        .cloned();

    // Only authenticated, non-enterprise traffic is limited.
    let Some(context) = context else {
        return next.run(request).await;
    };
    if context.key.is_none() {
        return next.run(request).await;
    }
    let Some(account) = &context.account else {
        return next.run(request).await;
    };
    if account.is_enterprise() {
        return next.run(request).await;
    }
    let limit = account
        .rate_limit_rpm
        .and_then(|rpm| u32::try_from(rpm).ok())
        .or(state.config.default_rate_limit_rpm);
    let Some(limit) = limit else {
        return next.run(request).await;
    };

    let decision = match check_and_increment(&state.cache, account.id, limit).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!(
                account_id = account.id,
                error = %e,
                "Rate limiter unavailable; admitting request"
            );
            return next.run(request).await;
        }
    };

    if decision.allowed {
        let mut response = next.run(request).await;
        apply_headers(&mut response, &decision);
        return response;
    }

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let retry_after = decision.reset_at.saturating_sub(now_secs).max(1);

    let body = ErrorResponse::with_type(
        "rate_limit_error",
        "rate_limit_exceeded",
        format!("Rate limit exceeded: {} requests per minute", decision.limit),
    );
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_headers(&mut response, &decision);
    if let Ok(v) = HeaderValue::try_from(retry_after.to_string()) {
        response.headers_mut().insert("Retry-After", v);
    }
    response
}

fn apply_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::try_from(decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::try_from(decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::try_from(decision.reset_at.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_window_admits_up_to_limit() {
        // Requests 1..=10 at t=0 of the window: prev is empty.
        for n in 1..=10 {
            let decision = decide(0, n, 10, 600);
            assert!(decision.allowed, "request {n} should pass");
            assert_eq!(decision.remaining, (10 - n) as u32);
        }
    }

    #[test]
    fn eleventh_request_mid_window_is_rejected() {
        // t=610: ten counted already, this INCR made it eleven.
        let decision = decide(0, 11, 10, 610);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, 660);
        // Retry-After at t=610 would be 50 seconds.
        assert_eq!(decision.reset_at - 610, 50);
    }

    #[test]
    fn new_window_discounts_previous_traffic() {
        // t=661: one second into the next window, previous window had 10.
        // estimate = floor(10 * (59/60) + 1) = 10 -> allowed at the edge.
        let decision = decide(10, 1, 10, 661);
        assert!(decision.allowed);

        // Late in the window the previous traffic has aged out entirely.
        let decision = decide(10, 1, 10, 719);
        assert!(decision.allowed);
        assert_eq!(decision.estimated, 1);
    }

    #[test]
    fn previous_window_weight_decays_linearly() {
        // Half way through: 30 of the previous 60 still count.
        let decision = decide(60, 0, 100, 630);
        assert_eq!(decision.estimated, 30);
        // Start of window: all of it counts.
        let decision = decide(60, 0, 100, 600);
        assert_eq!(decision.estimated, 60);
    }

    #[test]
    fn reset_is_the_next_window_boundary() {
        assert_eq!(decide(0, 1, 10, 0).reset_at, 60);
        assert_eq!(decide(0, 1, 10, 59).reset_at, 60);
        assert_eq!(decide(0, 1, 10, 60).reset_at, 120);
    }

    #[test]
    fn overage_allows_at_most_one_past_limit() {
        // The estimate includes this request's own increment, so the first
        // rejected request sees limit+1.
        let decision = decide(0, 10, 10, 600);
        assert!(decision.allowed);
        let decision = decide(0, 11, 10, 600);
        assert!(!decision.allowed);
    }
}
