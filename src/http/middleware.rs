//! Tower layer that enforces rate limits in front of an axum router.

use axum::extract::{ConnectInfo, Request};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::enforce::{DenialMessages, Enforcer, Verdict};
use crate::ratelimit::Decision;

/// `X-RateLimit-Limit`
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`, epoch seconds
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialBody {
    /// Human readable message
    pub detail: String,
    /// Whole seconds to wait before retrying
    pub retry_after: u64,
}

/// Write the `X-RateLimit-*` headers for a decision.
pub fn stamp_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_epoch_secs()));
}

/// Build the 429 response for a denial.
pub fn deny_response(decision: &Decision, messages: &DenialMessages) -> Response {
    let retry_after = decision.retry_after_secs();
    let body = DenialBody {
        detail: messages.for_decision(decision).to_string(),
        retry_after,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    stamp_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Rate limiting layer for Tower.
#[derive(Clone)]
pub struct RateLimitLayer {
    enforcer: Arc<Enforcer>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(enforcer: Arc<Enforcer>) -> Self {
        Self { enforcer }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            enforcer: self.enforcer.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    enforcer: Arc<Enforcer>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let enforcer = self.enforcer.clone();
        // The instance that was polled ready is the one that gets called
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let peer = parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0);

            let verdict = enforcer
                .evaluate(&parts.method, parts.uri.path(), &parts.headers, peer)
                .await;
            let request = Request::from_parts(parts, body);

            match verdict {
                Verdict::Exempt | Verdict::FailOpen => inner.call(request).await,
                Verdict::Allow(decision) => {
                    let mut response = inner.call(request).await?;
                    stamp_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Verdict::Deny(decision) => Ok(deny_response(&decision, enforcer.messages())),
            }
        })
    }
}
