//! Built-in global interceptors.
//!
//! The server registers these ahead of any application middleware, in this
//! order: [`RequestLogger`], [`ShutdownGuard`], [`TrailingSlash`].
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, StatusCode};
use tracing::Instrument;

use crate::{
    config::models::TrailingSlashMode,
    core::{
        error::{HandlerResult, HttpError},
        middleware::{Middleware, Next},
        request::Request,
        response::Response,
    },
    metrics, tracing_setup,
    utils::Lifecycle,
};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Runs each request inside a span, echoes the request id and records
/// request count and latency.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLogger;

#[async_trait]
impl Middleware for RequestLogger {
    async fn handle(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> HandlerResult {
        let request_id = req.id().to_string();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let span = tracing_setup::create_request_span(&method, &path, &request_id);

        async move {
            let timer = metrics::RequestTimer::new(&method);
            tracing::info!("Started processing {} {} {:?}", method, path, req.version());
            res.set_header(X_REQUEST_ID, &request_id)?;

            let result = next.run(req, res).await;

            // the top-level boundary turns an error into its status later on
            let status = match &result {
                Ok(()) => res.status(),
                Err(err) => err.status(),
            };
            let elapsed = timer.elapsed();
            let span = tracing::Span::current();
            span.record("http.status_code", status.as_u16());
            span.record("duration_ms", elapsed.as_millis() as u64);

            tracing::info!(
                "Completed {} {} - {} in {:?}",
                method,
                path,
                status.as_u16(),
                elapsed
            );
            metrics::increment_request_total(&method, status.as_u16());
            result
        }
        .instrument(span)
        .await
    }
}

/// Answers 503 with `Connection: close` once shutdown has begun.
#[derive(Debug, Clone)]
pub struct ShutdownGuard {
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownGuard {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl Middleware for ShutdownGuard {
    async fn handle(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> HandlerResult {
        if self.lifecycle.is_shutting_down() {
            tracing::debug!("Rejecting {} {} during shutdown", req.method(), req.path());
            res.send_error(&HttpError::ServiceUnavailable);
            return Ok(());
        }
        next.run(req, res).await
    }
}

/// Normalizes paths ending in `/` (other than the root).
#[derive(Debug, Clone, Copy)]
pub struct TrailingSlash {
    mode: TrailingSlashMode,
}

impl TrailingSlash {
    pub fn new(mode: TrailingSlashMode) -> Self {
        Self { mode }
    }
}

/// `path` without trailing slashes, or `None` if it has none to strip.
fn strip_trailing_slashes(path: &str) -> Option<String> {
    if path.len() <= 1 || !path.ends_with('/') {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    // a leading `//` would make the redirect target protocol-relative
    let trimmed = format!("/{}", trimmed.trim_start_matches('/'));
    Some(trimmed)
}

#[async_trait]
impl Middleware for TrailingSlash {
    async fn handle(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> HandlerResult {
        let Some(stripped) = strip_trailing_slashes(req.path()) else {
            return next.run(req, res).await;
        };

        match self.mode {
            TrailingSlashMode::Redirect => {
                let location = match req.uri().query() {
                    Some(query) => format!("{stripped}?{query}"),
                    None => stripped,
                };
                tracing::debug!("Redirecting {} to {}", req.path(), location);
                res.redirect(StatusCode::PERMANENT_REDIRECT, &location)?;
                Ok(())
            }
            TrailingSlashMode::Rewrite => {
                tracing::debug!("Rewriting {} to {}", req.path(), stripped);
                req.set_path(stripped);
                next.run(req, res).await
            }
            TrailingSlashMode::Ignore => next.run(req, res).await,
        }
    }
}
