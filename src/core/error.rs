//! Error taxonomy for request handling and route registration.
//!
//! [`HttpError`] covers everything that can go wrong while a request moves
//! through the pipeline and knows how to present itself to a client (status,
//! required headers, JSON envelope). [`RouteError`] is reported while routes
//! are compiled and registered, before the server accepts traffic.
use http::{HeaderName, HeaderValue, Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type returned by handlers and middleware.
pub type HandlerResult = Result<(), HttpError>;

/// Request-time failures, each mapped onto a status code.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    #[error("Bad request: {message}")]
    BadRequest {
        message: String,
        detail: Option<Value>,
    },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: missing required scope '{scope}'")]
    Forbidden { scope: String },

    #[error("Not found")]
    NotFound,

    #[error("Method {method} not allowed")]
    MethodNotAllowed { method: Method, allow: Vec<Method> },

    #[error("Payload too large: {message}")]
    PayloadTooLarge { message: String },

    #[error("Unsupported media type: {content_type}")]
    UnsupportedMediaType {
        content_type: String,
        method: Method,
        supported: Vec<String>,
    },

    #[error("Request validation failed")]
    Validation { detail: Value },

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Internal server error: {report}")]
    Internal {
        report: eyre::Report,
        detail: Option<Value>,
    },
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            detail: None,
        }
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::PayloadTooLarge {
            message: message.into(),
        }
    }

    pub fn internal(report: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            report: report.into(),
            detail: None,
        }
    }

    /// Status code presented to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest { .. } | HttpError::Validation { .. } => StatusCode::BAD_REQUEST,
            HttpError::Unauthorized => StatusCode::UNAUTHORIZED,
            HttpError::Forbidden { .. } => StatusCode::FORBIDDEN,
            HttpError::NotFound => StatusCode::NOT_FOUND,
            HttpError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            HttpError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            HttpError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Internal errors never expose their cause.
    pub fn public_message(&self) -> String {
        match self {
            HttpError::Internal { .. } => "Internal Server Error".to_string(),
            HttpError::NotFound => "Not Found".to_string(),
            HttpError::Unauthorized => "Unauthorized".to_string(),
            HttpError::ServiceUnavailable => "Service Unavailable".to_string(),
            other => other.to_string(),
        }
    }

    pub fn detail(&self) -> Option<&Value> {
        match self {
            HttpError::BadRequest { detail, .. } | HttpError::Internal { detail, .. } => {
                detail.as_ref()
            }
            HttpError::Validation { detail } => Some(detail),
            _ => None,
        }
    }

    /// Headers that must accompany the error status.
    pub fn required_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        match self {
            HttpError::MethodNotAllowed { allow, .. } => {
                let value = allow
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                HeaderValue::from_str(&value)
                    .map(|v| vec![(header::ALLOW, v)])
                    .unwrap_or_default()
            }
            HttpError::UnsupportedMediaType {
                method, supported, ..
            } => {
                let name = accept_header_for(method);
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&supported.join(", ")),
                ) {
                    (Ok(name), Ok(value)) => vec![(name, value)],
                    _ => Vec::new(),
                }
            }
            HttpError::ServiceUnavailable => {
                vec![(header::CONNECTION, HeaderValue::from_static("close"))]
            }
            _ => Vec::new(),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: self.status().as_u16(),
            message: self.public_message(),
            detail: self.detail().cloned(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, HttpError::Internal { .. })
    }
}

impl From<eyre::Report> for HttpError {
    fn from(report: eyre::Report) -> Self {
        HttpError::internal(report)
    }
}

/// Name of the header that advertises accepted media types for `method`,
/// e.g. `Accept-Post` or `Accept-Patch`.
pub fn accept_header_for(method: &Method) -> String {
    let lower = method.as_str().to_ascii_lowercase();
    let mut chars = lower.chars();
    let titled: String = match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    };
    format!("Accept-{titled}")
}

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Failures detected while compiling and registering routes.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouteError {
    #[error("Unterminated placeholder in pattern '{pattern}' starting at byte {position}")]
    UnterminatedPlaceholder { pattern: String, position: usize },

    #[error("Invalid parameter name '{name}' in pattern '{pattern}'")]
    InvalidParameterName { pattern: String, name: String },

    #[error("Parameter '{name}' appears more than once in pattern '{pattern}'")]
    DuplicateParameter { pattern: String, name: String },

    #[error("Invalid regex for pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid HTTP method '{method}'")]
    InvalidMethod { method: String },

    #[error("Method {method} is already bound for '{path}'")]
    DuplicateMethod { method: String, path: String },

    #[error("Route '{path}' references unknown auth strategy '{strategy}'")]
    UnknownStrategy { path: String, strategy: String },

    #[error("Route manifest {file} references unknown handler '{handler}'")]
    UnknownHandler { file: String, handler: String },

    #[error("Invalid {location} schema for route '{path}': {message}")]
    InvalidSchema {
        path: String,
        location: String,
        message: String,
    },

    #[error("Failed to load routes from {path}: {message}")]
    Discovery { path: String, message: String },

    #[error("Route table is finalized; cannot register '{path}'")]
    TableFinalized { path: String },
}
