//! The inbound side of one request as it moves through the pipeline.
//!
//! A [`Request`] is owned by a single connection task and handed by `&mut`
//! from stage to stage: the dispatcher fills in path parameters, the
//! authentication result and the parsed payload as it goes.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Mutex, PoisonError},
    time::Instant,
};

use axum::body::Body;
use http::{Extensions, HeaderMap, Method, Uri, Version, header};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    core::{body::Payload, error::HttpError, path_matcher::PathParams},
    ports::AuthResult,
};

/// The route a request was matched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRoute {
    /// Normalized pattern of the matched table entry.
    pub pattern: String,
    /// Name of the router that registered the route.
    pub router: String,
}

pub struct Request {
    id: Uuid,
    method: Method,
    uri: Uri,
    path: String,
    version: Version,
    headers: HeaderMap,
    extensions: Extensions,
    // the body type is not `Sync`; the lock lets `&Request` cross await points
    body: Option<Mutex<Body>>,
    cookies: HashMap<String, String>,
    query: Map<String, Value>,
    params: PathParams,
    auth: AuthResult,
    payload: Payload,
    route: Option<MatchedRoute>,
    remote_addr: Option<SocketAddr>,
    received_at: Instant,
}

impl Request {
    /// Wrap an HTTP request received from `remote_addr`.
    pub fn from_http(req: http::Request<Body>, remote_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let query = parts
            .uri
            .query()
            .map(|q| collect_pairs(url::form_urlencoded::parse(q.as_bytes())))
            .unwrap_or_default();
        let cookies = parse_cookies(&parts.headers);

        Self {
            id: Uuid::new_v4(),
            method: parts.method,
            uri: parts.uri,
            path,
            version: parts.version,
            headers: parts.headers,
            extensions: parts.extensions,
            body: Some(Mutex::new(body)),
            cookies,
            query,
            params: PathParams::new(),
            auth: AuthResult::unauthenticated(),
            payload: Payload::None,
            route: None,
            remote_addr,
            received_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Path used for routing. May differ from `uri().path()` after
    /// trailing-slash rewriting.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as a string, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Query string parameters; repeated names collapse into arrays.
    pub fn query(&self) -> &Map<String, Value> {
        &self.query
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        match self.query.get(name)? {
            Value::String(s) => Some(s),
            Value::Array(values) => values.first().and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    pub fn auth(&self) -> &AuthResult {
        &self.auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    pub(crate) fn set_auth(&mut self, auth: AuthResult) {
        self.auth = auth;
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    /// Deserialize the parsed payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_value(self.payload.to_value())
            .map_err(|e| HttpError::bad_request(format!("Invalid request payload: {e}")))
    }

    /// Take the unread body. `None` once the body parser has consumed it.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body
            .take()
            .map(|body| body.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn route(&self) -> Option<&MatchedRoute> {
        self.route.as_ref()
    }

    pub(crate) fn set_route(&mut self, route: MatchedRoute) {
        self.route = Some(route);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("params", &self.params)
            .field("authenticated", &self.auth.authenticated)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

/// Collect name/value pairs into a map, turning repeated names into arrays.
pub(crate) fn collect_pairs<K, V, I>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut map = Map::new();
    for (key, value) in pairs {
        insert_repeated(&mut map, key.into(), Value::String(value.into()));
    }
    map
}

pub(crate) fn insert_repeated(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if let Some((name, val)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    cookies.insert(name.to_string(), val.trim().trim_matches('"').to_string());
                }
            }
        }
    }
    cookies
}
