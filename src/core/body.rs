//! Request body parsing.
//!
//! The effective content type is taken from the `Content-Type` header, then the
//! route's default, then `application/json`. Bodies are read frame by frame
//! against a byte budget so that an oversized upload is rejected as soon as it
//! crosses the limit, without buffering the rest of it.
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http::{Method, header};
use http_body_util::BodyExt;
use hyper::body::Body as _;
use serde_json::{Map, Value};

use crate::{
    config::models::PayloadLimits,
    core::{
        error::HttpError,
        multipart::{self, MultipartForm},
        options::PayloadOptions,
        request::{Request, collect_pairs},
    },
};

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// A parsed request body.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Json(Value),
    Form(Map<String, Value>),
    Multipart(MultipartForm),
    Text(String),
}

impl Payload {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&Map<String, Value>> {
        match self {
            Payload::Form(map) => Some(map),
            Payload::Multipart(form) => Some(&form.fields),
            _ => None,
        }
    }

    pub fn as_multipart(&self) -> Option<&MultipartForm> {
        match self {
            Payload::Multipart(form) => Some(form),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// JSON view of the payload, used for validation and deserialization.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::None => Value::Null,
            Payload::Json(value) => value.clone(),
            Payload::Form(map) => Value::Object(map.clone()),
            Payload::Multipart(form) => form.to_value(),
            Payload::Text(text) => Value::String(text.clone()),
        }
    }
}

/// Media types the parser knows how to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    UrlEncoded,
    Multipart,
    /// Anything else; passed through as text.
    Other(String),
}

impl ContentKind {
    pub fn from_essence(essence: &str) -> Self {
        match essence {
            "application/json" => ContentKind::Json,
            "application/x-www-form-urlencoded" => ContentKind::UrlEncoded,
            "multipart/form-data" => ContentKind::Multipart,
            other if other.ends_with("+json") => ContentKind::Json,
            other => ContentKind::Other(other.to_string()),
        }
    }
}

/// Media type without parameters, lowercased.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether requests with `method` get their body parsed.
pub fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Outcome of pushing a chunk into a [`BodyAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Accepted,
    /// This chunk crossed the limit; accumulation is aborted.
    LimitExceeded,
    /// The accumulator was already aborted or complete; the chunk is dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccumulatorState {
    Collecting,
    Aborted,
    Complete,
}

/// Collects body chunks up to a byte limit. The limit is checked on every
/// chunk, and once exceeded every later chunk is ignored.
#[derive(Debug)]
pub struct BodyAccumulator {
    limit: usize,
    buf: BytesMut,
    state: AccumulatorState,
}

impl BodyAccumulator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: BytesMut::new(),
            state: AccumulatorState::Collecting,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Push {
        if self.state != AccumulatorState::Collecting {
            return Push::Ignored;
        }
        if self.buf.len() + chunk.len() > self.limit {
            self.state = AccumulatorState::Aborted;
            self.buf.clear();
            return Push::LimitExceeded;
        }
        self.buf.extend_from_slice(chunk);
        Push::Accepted
    }

    pub fn is_aborted(&self) -> bool {
        self.state == AccumulatorState::Aborted
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The collected bytes, or `None` if accumulation was aborted.
    pub fn finish(&mut self) -> Option<Bytes> {
        match self.state {
            AccumulatorState::Collecting => {
                self.state = AccumulatorState::Complete;
                Some(std::mem::take(&mut self.buf).freeze())
            }
            AccumulatorState::Aborted | AccumulatorState::Complete => None,
        }
    }
}

/// Reads and decodes request bodies according to a route's payload options.
#[derive(Debug, Clone)]
pub struct BodyParser {
    options: PayloadOptions,
    limits: PayloadLimits,
}

impl BodyParser {
    pub fn new(options: Option<&PayloadOptions>, server_limits: &PayloadLimits) -> Self {
        let options = options.cloned().unwrap_or_default();
        let limits = options.limits(server_limits);
        Self { options, limits }
    }

    pub fn limits(&self) -> &PayloadLimits {
        &self.limits
    }

    /// Effective media type essence for `req`.
    pub fn effective_content_type(&self, req: &Request) -> String {
        req.content_type()
            .map(essence)
            .filter(|e| !e.is_empty())
            .or_else(|| self.options.default_content_type.as_deref().map(essence))
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }

    /// Consume the request body and decode it.
    pub async fn parse(&self, req: &mut Request) -> Result<Payload, HttpError> {
        let Some(body) = req.take_body() else {
            return Ok(Payload::None);
        };
        if declared_length(req) == Some(0) || body.is_end_stream() {
            return Ok(Payload::None);
        }

        let content_type = self.effective_content_type(req);

        if let Some(allowed) = &self.options.allowed {
            if !allowed.iter().any(|a| essence(a) == content_type) {
                return Err(HttpError::UnsupportedMediaType {
                    content_type,
                    method: req.method().clone(),
                    supported: allowed.clone(),
                });
            }
        }

        if let Some(length) = declared_length(req) {
            if length > self.limits.max_bytes as u64 {
                return Err(self.too_large());
            }
        }

        match ContentKind::from_essence(&content_type) {
            ContentKind::Multipart => {
                let raw_type = req.content_type().unwrap_or_default();
                let boundary = multer::parse_boundary(raw_type).map_err(|e| {
                    HttpError::bad_request(format!("Invalid multipart content type: {e}"))
                })?;
                let form = multipart::decode(body, boundary, &self.limits).await?;
                Ok(Payload::Multipart(form))
            }
            kind => {
                let bytes = self.read_to_limit(body).await?;
                if bytes.is_empty() {
                    return Ok(Payload::None);
                }
                decode_buffered(kind, &bytes)
            }
        }
    }

    async fn read_to_limit(&self, mut body: Body) -> Result<Bytes, HttpError> {
        let mut acc = BodyAccumulator::new(self.limits.max_bytes);
        while let Some(frame) = body.frame().await {
            let frame = frame
                .map_err(|e| HttpError::bad_request(format!("Failed to read request body: {e}")))?;
            if let Ok(data) = frame.into_data() {
                if acc.push(&data) == Push::LimitExceeded {
                    tracing::debug!(
                        "Request body exceeded {} bytes, aborting read",
                        self.limits.max_bytes
                    );
                    return Err(self.too_large());
                }
            }
        }
        Ok(acc.finish().unwrap_or_default())
    }

    fn too_large(&self) -> HttpError {
        HttpError::payload_too_large(format!(
            "Request body exceeds {} bytes",
            self.limits.max_bytes
        ))
    }
}

fn declared_length(req: &Request) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn decode_buffered(kind: ContentKind, bytes: &[u8]) -> Result<Payload, HttpError> {
    match kind {
        ContentKind::Json => serde_json::from_slice(bytes)
            .map(Payload::Json)
            .map_err(|e| HttpError::bad_request(format!("Malformed JSON body: {e}"))),
        ContentKind::UrlEncoded => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| HttpError::bad_request("Form body is not valid UTF-8"))?;
            Ok(Payload::Form(collect_pairs(url::form_urlencoded::parse(
                text.as_bytes(),
            ))))
        }
        ContentKind::Multipart | ContentKind::Other(_) => {
            Ok(Payload::Text(String::from_utf8_lossy(bytes).into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use http::StatusCode;
    use serde_json::json;

    use super::*;

    fn request(content_type: Option<&str>, body: Body) -> Request {
        let mut builder = http::Request::builder().method(Method::POST).uri("/upload");
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        Request::from_http(builder.body(body).unwrap(), None)
    }

    fn parser(options: PayloadOptions) -> BodyParser {
        BodyParser::new(Some(&options), &PayloadLimits::default())
    }

    #[test]
    fn test_accumulator_ignores_chunks_after_abort() {
        let mut acc = BodyAccumulator::new(4);
        assert_eq!(acc.push(b"ab"), Push::Accepted);
        assert_eq!(acc.push(b"cde"), Push::LimitExceeded);
        assert_eq!(acc.push(b"f"), Push::Ignored);
        assert!(acc.is_aborted());
        assert!(acc.finish().is_none());
    }

    #[test]
    fn test_accumulator_accepts_exact_limit() {
        let mut acc = BodyAccumulator::new(4);
        assert_eq!(acc.push(b"abcd"), Push::Accepted);
        assert_eq!(acc.finish().as_deref(), Some(&b"abcd"[..]));
        assert_eq!(acc.push(b"e"), Push::Ignored);
    }

    #[test]
    fn test_content_kind_and_essence() {
        assert_eq!(essence("Application/JSON; charset=utf-8"), "application/json");
        assert_eq!(ContentKind::from_essence("application/vnd.api+json"), ContentKind::Json);
        assert_eq!(
            ContentKind::from_essence("text/csv"),
            ContentKind::Other("text/csv".to_string())
        );
        assert!(carries_body(&Method::PATCH));
        assert!(!carries_body(&Method::GET));
    }

    #[tokio::test]
    async fn test_json_body_parses() {
        let mut req = request(Some("application/json"), Body::from(r#"{"a":1}"#));
        let payload = parser(PayloadOptions::default()).parse(&mut req).await.unwrap();
        assert_eq!(payload.as_json(), Some(&json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_missing_content_type_defaults_to_json() {
        let mut req = request(None, Body::from("not json"));
        let err = parser(PayloadOptions::default()).parse(&mut req).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_route_default_content_type_applies() {
        let options = PayloadOptions {
            default_content_type: Some("text/plain".to_string()),
            ..PayloadOptions::default()
        };
        let mut req = request(None, Body::from("hello"));
        let payload = parser(options).parse(&mut req).await.unwrap();
        assert_eq!(payload.as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn test_form_repeats_collapse() {
        let mut req = request(
            Some("application/x-www-form-urlencoded"),
            Body::from("name=ada&tag=x&tag=y"),
        );
        let payload = parser(PayloadOptions::default()).parse(&mut req).await.unwrap();
        assert_eq!(
            payload.to_value(),
            json!({"name": "ada", "tag": ["x", "y"]})
        );
    }

    #[tokio::test]
    async fn test_disallowed_type_is_415() {
        let mut req = request(Some("text/csv"), Body::from("a,b"));
        let err = parser(PayloadOptions::allow(&["application/json"]))
            .parse(&mut req)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let headers = err.required_headers();
        assert_eq!(headers[0].0.as_str(), "accept-post");
    }

    #[tokio::test]
    async fn test_empty_body_skips_content_type_checks() {
        let options = PayloadOptions::allow(&["multipart/form-data"]);

        let mut req = request(None, Body::empty());
        let payload = parser(options.clone()).parse(&mut req).await.unwrap();
        assert!(payload.is_none());

        let builder = http::Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(header::CONTENT_LENGTH, "0");
        let mut req = Request::from_http(builder.body(Body::from("")).unwrap(), None);
        assert!(parser(options.clone()).parse(&mut req).await.unwrap().is_none());

        let mut req = request(None, Body::from("x"));
        let err = parser(options).parse(&mut req).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_413() {
        let mut builder = http::Request::builder().method(Method::POST).uri("/");
        builder = builder.header(header::CONTENT_LENGTH, "100");
        let mut req = Request::from_http(builder.body(Body::from("x")).unwrap(), None);
        let err = parser(PayloadOptions::default().with_max_bytes(10))
            .parse(&mut req)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unbounded_stream_aborts_at_limit() {
        let chunks = stream::repeat_with(|| Ok::<_, std::io::Error>(Bytes::from_static(&[b'a'; 1024])));
        let mut req = request(Some("text/plain"), Body::from_stream(chunks));
        let err = parser(PayloadOptions::default().with_max_bytes(64 * 1024))
            .parse(&mut req)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_empty_body_is_none() {
        let mut req = request(Some("application/json"), Body::empty());
        let payload = parser(PayloadOptions::default()).parse(&mut req).await.unwrap();
        assert!(payload.is_none());
    }
}
