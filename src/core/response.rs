//! The outbound side of one request.
//!
//! Headers stay mutable until the response is ended or starts streaming.
//! Cache-control options are staged and only written when the response is
//! flushed, and only if the handler did not set its own `Cache-Control`.
use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde::Serialize;
use thiserror::Error;

use crate::core::{error::HttpError, options::CacheOptions};

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("Headers have already been sent")]
    HeadersSent,

    #[error("Response has already ended")]
    AlreadyEnded,

    #[error("Invalid value for header {name}")]
    InvalidHeader { name: String },

    #[error("Failed to serialize response body: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<ResponseError> for HttpError {
    fn from(err: ResponseError) -> Self {
        HttpError::internal(eyre::Report::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Streaming,
    Ended,
}

pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    staged_cache: Option<HeaderValue>,
    body: Option<Body>,
    state: State,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            staged_cache: None,
            body: None,
            state: State::Open,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// True once the response is ended or streaming.
    pub fn headers_sent(&self) -> bool {
        self.state != State::Open
    }

    pub fn is_ended(&self) -> bool {
        self.state == State::Ended
    }

    pub fn is_streaming(&self) -> bool {
        self.state == State::Streaming
    }

    fn ensure_open(&self) -> Result<(), ResponseError> {
        match self.state {
            State::Open => Ok(()),
            State::Streaming => Err(ResponseError::HeadersSent),
            State::Ended => Err(ResponseError::AlreadyEnded),
        }
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<&mut Self, ResponseError> {
        self.ensure_open()?;
        self.status = status;
        Ok(self)
    }

    pub fn set_header(
        &mut self,
        name: HeaderName,
        value: impl AsRef<str>,
    ) -> Result<&mut Self, ResponseError> {
        self.ensure_open()?;
        let value =
            HeaderValue::from_str(value.as_ref()).map_err(|_| ResponseError::InvalidHeader {
                name: name.to_string(),
            })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn insert_header(
        &mut self,
        name: HeaderName,
        value: HeaderValue,
    ) -> Result<&mut Self, ResponseError> {
        self.ensure_open()?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn append_header(
        &mut self,
        name: HeaderName,
        value: HeaderValue,
    ) -> Result<&mut Self, ResponseError> {
        self.ensure_open()?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn remove_header(&mut self, name: &HeaderName) -> Result<&mut Self, ResponseError> {
        self.ensure_open()?;
        self.headers.remove(name);
        Ok(self)
    }

    /// Replace whatever cache-control directives are staged.
    pub fn cache_control(&mut self, options: &CacheOptions) -> Result<&mut Self, ResponseError> {
        self.ensure_open()?;
        self.stage_cache_control(options);
        Ok(self)
    }

    pub(crate) fn stage_cache_control(&mut self, options: &CacheOptions) {
        self.staged_cache = options
            .header_value()
            .and_then(|v| HeaderValue::from_str(&v).ok());
    }

    /// The staged `Cache-Control` value, if any.
    pub fn staged_cache_control(&self) -> Option<&HeaderValue> {
        self.staged_cache.as_ref()
    }

    /// End the response with an arbitrary body.
    pub fn send(
        &mut self,
        status: StatusCode,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.status = status;
        self.set_header(header::CONTENT_TYPE, content_type)?;
        self.body = Some(Body::from(body.into()));
        self.state = State::Ended;
        Ok(())
    }

    pub fn json<T: Serialize + ?Sized>(
        &mut self,
        status: StatusCode,
        value: &T,
    ) -> Result<(), ResponseError> {
        self.ensure_open()?;
        let encoded = serde_json::to_vec(value)?;
        self.send(status, "application/json", encoded)
    }

    pub fn text(&mut self, status: StatusCode, text: impl Into<String>) -> Result<(), ResponseError> {
        self.send(status, "text/plain; charset=utf-8", text.into())
    }

    pub fn redirect(&mut self, status: StatusCode, location: &str) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.set_header(header::LOCATION, location)?;
        self.status = status;
        self.end()
    }

    /// Start streaming `body`. Headers are sent from this point on.
    pub fn stream(&mut self, status: StatusCode, body: Body) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.status = status;
        self.body = Some(body);
        self.state = State::Streaming;
        Ok(())
    }

    /// End the response with whatever status and headers were set.
    pub fn end(&mut self) -> Result<(), ResponseError> {
        self.ensure_open()?;
        self.state = State::Ended;
        Ok(())
    }

    /// Finalize the response as an error envelope.
    ///
    /// Once the response has ended or started streaming only a log entry is
    /// produced.
    pub fn send_error(&mut self, err: &HttpError) {
        if self.state != State::Open {
            tracing::warn!(
                "Cannot send error response, response already {}: {}",
                if self.is_streaming() { "streaming" } else { "ended" },
                err
            );
            return;
        }

        // error envelopes must never be stored under the route's directives
        self.staged_cache = None;
        self.headers
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        for (name, value) in err.required_headers() {
            self.headers.insert(name, value);
        }
        if let Err(e) = self.json(err.status(), &err.envelope()) {
            tracing::error!("Failed to write error response: {}", e);
            self.status = err.status();
            self.state = State::Ended;
        }
    }

    pub fn bad_request(&mut self, message: impl Into<String>) {
        self.send_error(&HttpError::bad_request(message));
    }

    pub fn unauthorized(&mut self) {
        self.send_error(&HttpError::Unauthorized);
    }

    pub fn forbidden(&mut self, scope: impl Into<String>) {
        self.send_error(&HttpError::Forbidden {
            scope: scope.into(),
        });
    }

    pub fn not_found(&mut self) {
        self.send_error(&HttpError::NotFound);
    }

    pub fn method_not_allowed(&mut self, method: Method, allow: Vec<Method>) {
        self.send_error(&HttpError::MethodNotAllowed { method, allow });
    }

    pub fn payload_too_large(&mut self, message: impl Into<String>) {
        self.send_error(&HttpError::payload_too_large(message));
    }

    pub fn unsupported_media_type(
        &mut self,
        content_type: impl Into<String>,
        method: Method,
        supported: Vec<String>,
    ) {
        self.send_error(&HttpError::UnsupportedMediaType {
            content_type: content_type.into(),
            method,
            supported,
        });
    }

    pub fn internal_error(&mut self, report: eyre::Report) {
        self.send_error(&HttpError::internal(report));
    }

    pub fn service_unavailable(&mut self) {
        self.send_error(&HttpError::ServiceUnavailable);
    }

    /// Flush into an HTTP response, applying staged cache-control.
    pub fn into_http(mut self) -> http::Response<Body> {
        if let Some(value) = self.staged_cache.take() {
            if !self.headers.contains_key(header::CACHE_CONTROL) {
                self.headers.insert(header::CACHE_CONTROL, value);
            }
        }

        let mut response = http::Response::new(self.body.unwrap_or_else(Body::empty));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::core::error::ErrorEnvelope;

    async fn body_bytes(res: http::Response<Body>) -> Bytes {
        res.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_ending_twice_is_an_error() {
        let mut res = Response::new();
        res.text(StatusCode::OK, "hello").unwrap();
        assert!(matches!(res.end(), Err(ResponseError::AlreadyEnded)));
        assert!(matches!(
            res.set_header(header::ETAG, "x"),
            Err(ResponseError::AlreadyEnded)
        ));
    }

    #[test]
    fn test_headers_locked_after_stream() {
        let mut res = Response::new();
        res.stream(StatusCode::OK, Body::from("chunk")).unwrap();
        assert!(res.headers_sent());
        assert!(matches!(
            res.set_status(StatusCode::ACCEPTED),
            Err(ResponseError::HeadersSent)
        ));
    }

    #[test]
    fn test_staged_cache_control_yields_to_handler_header() {
        let mut res = Response::new();
        res.stage_cache_control(&CacheOptions::max_age(60));
        res.set_header(header::CACHE_CONTROL, "no-cache").unwrap();
        res.end().unwrap();
        let http = res.into_http();
        assert_eq!(http.headers()[header::CACHE_CONTROL], "no-cache");

        let mut res = Response::new();
        res.stage_cache_control(&CacheOptions::max_age(60));
        res.end().unwrap();
        let http = res.into_http();
        assert_eq!(http.headers()[header::CACHE_CONTROL], "public, max-age=60");
    }

    #[test]
    fn test_handler_can_override_staged_directives() {
        let mut res = Response::new();
        res.stage_cache_control(&CacheOptions::max_age(60));
        res.cache_control(&CacheOptions::no_store()).unwrap();
        res.end().unwrap();
        assert_eq!(res.into_http().headers()[header::CACHE_CONTROL], "no-store");
    }

    #[test]
    fn test_error_envelope_discards_route_cache_directives() {
        let mut res = Response::new();
        res.stage_cache_control(&CacheOptions::max_age(3600));
        res.set_header(header::CACHE_CONTROL, "public, max-age=60").unwrap();
        res.unauthorized();
        let http = res.into_http();
        assert_eq!(http.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(http.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[test]
    fn test_streaming_response_is_not_ended() {
        let mut res = Response::new();
        res.stream(StatusCode::OK, Body::from("chunk")).unwrap();
        assert!(res.headers_sent());
        assert!(!res.is_ended());
        res.end().unwrap_err();

        let mut res = Response::new();
        res.text(StatusCode::OK, "done").unwrap();
        assert!(res.is_ended());
    }

    #[tokio::test]
    async fn test_method_not_allowed_envelope() {
        let mut res = Response::new();
        res.method_not_allowed(Method::DELETE, vec![Method::GET, Method::POST]);
        let http = res.into_http();
        assert_eq!(http.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(http.headers()[header::ALLOW], "GET, POST");

        let envelope: ErrorEnvelope = serde_json::from_slice(&body_bytes(http).await).unwrap();
        assert_eq!(envelope.status, 405);
    }

    #[test]
    fn test_error_after_end_keeps_original_response() {
        let mut res = Response::new();
        res.text(StatusCode::CREATED, "done").unwrap();
        res.not_found();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_unended_response_flushes_empty_body() {
        let mut res = Response::new();
        res.set_status(StatusCode::NO_CONTENT).unwrap();
        let http = res.into_http();
        assert_eq!(http.status(), StatusCode::NO_CONTENT);
        assert!(body_bytes(http).await.is_empty());
    }
}
