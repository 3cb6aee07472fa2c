//! Per-client fixed-window rate limiting for individual routes.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimit;
use crate::error::Error;

/// Expired windows are swept once this many clients are tracked.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Request counters for one route, keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    route: &'static str,
    limit: RateLimit,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(route: &'static str, limit: RateLimit) -> Self {
        Self {
            route,
            limit,
            windows: DashMap::new(),
        }
    }

    /// Count one request from `client`.
    ///
    /// Returns the time until the client's window resets when it is over budget.
    pub fn check(&self, client: &str) -> Result<(), Duration> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> Result<(), Duration> {
        if !self.limit.is_enabled() {
            return Ok(());
        }

        if self.windows.len() >= SWEEP_THRESHOLD {
            let window = self.limit.window;
            self.windows
                .retain(|_, w| now.saturating_duration_since(w.started) < window);
        }

        let mut entry = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(entry.started) >= self.limit.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= self.limit.max_requests {
            let elapsed = now.saturating_duration_since(entry.started);
            return Err(self.limit.window.saturating_sub(elapsed));
        }
        entry.count += 1;
        Ok(())
    }
}

/// Client identity: the peer IP when the server exposes it.
fn client_id(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware rejecting over-budget clients with 429 and `Retry-After`.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(&request);
    match limiter.check(&client) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(
                route = limiter.route,
                client = %client,
                limit = %limiter.limit,
                "Rate limit exceeded"
            );
            let mut response = Error::RateLimited(limiter.limit.to_string()).into_response();
            let secs = retry_after.as_secs().max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            response
        }
    }
}
