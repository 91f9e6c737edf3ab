//! Per-route option bundles.
//!
//! Every field is optional so that a router's defaults can be merged into
//! each of its routes field by field, with the route's own values winning.
use http::{HeaderName, HeaderValue, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::models::PayloadLimits;

fn pick<T: Clone>(own: &Option<T>, fallback: &Option<T>) -> Option<T> {
    own.clone().or_else(|| fallback.clone())
}

fn merge_bundle<T: Clone>(
    own: &Option<T>,
    fallback: &Option<T>,
    merge: impl Fn(&T, &T) -> T,
) -> Option<T> {
    match (own, fallback) {
        (Some(own), Some(fallback)) => Some(merge(own, fallback)),
        (Some(own), None) => Some(own.clone()),
        (None, Some(fallback)) => Some(fallback.clone()),
        (None, None) => None,
    }
}

/// `Cache-Control` directives. Staged on the response and written only when
/// the response is flushed, so handlers can still override them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub private: Option<bool>,
    pub no_cache: Option<bool>,
    pub no_store: Option<bool>,
    pub must_revalidate: Option<bool>,
    pub immutable: Option<bool>,
}

impl CacheOptions {
    /// `Cache-Control: no-store`
    pub fn no_store() -> Self {
        Self {
            no_store: Some(true),
            ..Self::default()
        }
    }

    /// Cacheable for `seconds`; public unless marked private.
    pub fn max_age(seconds: u64) -> Self {
        Self {
            max_age: Some(seconds),
            ..Self::default()
        }
    }

    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            max_age: pick(&self.max_age, &defaults.max_age),
            s_maxage: pick(&self.s_maxage, &defaults.s_maxage),
            private: pick(&self.private, &defaults.private),
            no_cache: pick(&self.no_cache, &defaults.no_cache),
            no_store: pick(&self.no_store, &defaults.no_store),
            must_revalidate: pick(&self.must_revalidate, &defaults.must_revalidate),
            immutable: pick(&self.immutable, &defaults.immutable),
        }
    }

    /// Render the directives, or `None` if nothing is set.
    pub fn header_value(&self) -> Option<String> {
        let mut directives: Vec<String> = Vec::new();
        let cacheable = self.max_age.is_some() || self.s_maxage.is_some();

        match self.private {
            Some(true) => directives.push("private".to_string()),
            Some(false) => directives.push("public".to_string()),
            None if cacheable => directives.push("public".to_string()),
            None => {}
        }
        if self.no_store == Some(true) {
            directives.push("no-store".to_string());
        }
        if self.no_cache == Some(true) {
            directives.push("no-cache".to_string());
        }
        if let Some(max_age) = self.max_age {
            directives.push(format!("max-age={max_age}"));
        }
        if let Some(s_maxage) = self.s_maxage {
            directives.push(format!("s-maxage={s_maxage}"));
        }
        if self.must_revalidate == Some(true) {
            directives.push("must-revalidate".to_string());
        }
        if self.immutable == Some(true) {
            directives.push("immutable".to_string());
        }

        if directives.is_empty() {
            None
        } else {
            Some(directives.join(", "))
        }
    }
}

/// Security response headers applied before the handler runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    pub content_type_nosniff: Option<bool>,
    pub frame_options: Option<String>,
    pub referrer_policy: Option<String>,
    pub xss_protection: Option<bool>,
    pub hsts_max_age: Option<u64>,
    pub hsts_include_subdomains: Option<bool>,
    pub content_security_policy: Option<String>,
}

impl SecurityOptions {
    /// The usual hardening set: nosniff, deny framing, strict referrer.
    pub fn hardened() -> Self {
        Self {
            content_type_nosniff: Some(true),
            frame_options: Some("DENY".to_string()),
            referrer_policy: Some("strict-origin-when-cross-origin".to_string()),
            xss_protection: Some(true),
            ..Self::default()
        }
    }

    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            content_type_nosniff: pick(&self.content_type_nosniff, &defaults.content_type_nosniff),
            frame_options: pick(&self.frame_options, &defaults.frame_options),
            referrer_policy: pick(&self.referrer_policy, &defaults.referrer_policy),
            xss_protection: pick(&self.xss_protection, &defaults.xss_protection),
            hsts_max_age: pick(&self.hsts_max_age, &defaults.hsts_max_age),
            hsts_include_subdomains: pick(
                &self.hsts_include_subdomains,
                &defaults.hsts_include_subdomains,
            ),
            content_security_policy: pick(
                &self.content_security_policy,
                &defaults.content_security_policy,
            ),
        }
    }

    /// Headers to write. Values that are not valid header values are
    /// skipped with a warning.
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = Vec::new();

        if self.content_type_nosniff == Some(true) {
            headers.push((
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ));
        }
        if self.xss_protection == Some(true) {
            headers.push((
                header::X_XSS_PROTECTION,
                HeaderValue::from_static("1; mode=block"),
            ));
        }
        if let Some(max_age) = self.hsts_max_age {
            let mut value = format!("max-age={max_age}");
            if self.hsts_include_subdomains == Some(true) {
                value.push_str("; includeSubDomains");
            }
            push_checked(&mut headers, header::STRICT_TRANSPORT_SECURITY, &value);
        }
        if let Some(value) = &self.frame_options {
            push_checked(&mut headers, header::X_FRAME_OPTIONS, value);
        }
        if let Some(value) = &self.referrer_policy {
            push_checked(&mut headers, header::REFERRER_POLICY, value);
        }
        if let Some(value) = &self.content_security_policy {
            push_checked(&mut headers, header::CONTENT_SECURITY_POLICY, value);
        }

        headers
    }
}

fn push_checked(headers: &mut Vec<(HeaderName, HeaderValue)>, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => headers.push((name, value)),
        Err(_) => tracing::warn!("Invalid security header value: {} = {}", name, value),
    }
}

/// Authentication requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    /// Strategy names, tried in order until one authenticates.
    pub strategies: Option<Vec<String>>,
    /// Let unauthenticated requests through instead of answering 401.
    pub optional: Option<bool>,
    /// Scope the authenticated principal must hold.
    pub scope: Option<String>,
}

impl AuthOptions {
    pub fn required(strategies: &[&str]) -> Self {
        Self {
            strategies: Some(strategies.iter().map(|s| s.to_string()).collect()),
            optional: Some(false),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = Some(true);
        self
    }

    pub fn strategy_names(&self) -> &[String] {
        self.strategies.as_deref().unwrap_or_default()
    }

    pub fn is_optional(&self) -> bool {
        self.optional.unwrap_or(false)
    }

    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            strategies: pick(&self.strategies, &defaults.strategies),
            optional: pick(&self.optional, &defaults.optional),
            scope: pick(&self.scope, &defaults.scope),
        }
    }
}

/// Body parsing rules. Unset limits fall back to the server-wide
/// [`PayloadLimits`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadOptions {
    /// Accepted media types (essence only, e.g. `application/json`).
    pub allowed: Option<Vec<String>>,
    /// Media type assumed when the request has no `Content-Type`.
    pub default_content_type: Option<String>,
    pub max_bytes: Option<usize>,
    pub max_parts: Option<usize>,
    pub max_fields: Option<usize>,
    pub max_files: Option<usize>,
    pub max_field_name_bytes: Option<usize>,
    pub max_field_value_bytes: Option<usize>,
    pub max_file_bytes: Option<usize>,
}

impl PayloadOptions {
    pub fn allow(types: &[&str]) -> Self {
        Self {
            allowed: Some(types.iter().map(|t| t.to_ascii_lowercase()).collect()),
            ..Self::default()
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            allowed: pick(&self.allowed, &defaults.allowed),
            default_content_type: pick(&self.default_content_type, &defaults.default_content_type),
            max_bytes: pick(&self.max_bytes, &defaults.max_bytes),
            max_parts: pick(&self.max_parts, &defaults.max_parts),
            max_fields: pick(&self.max_fields, &defaults.max_fields),
            max_files: pick(&self.max_files, &defaults.max_files),
            max_field_name_bytes: pick(&self.max_field_name_bytes, &defaults.max_field_name_bytes),
            max_field_value_bytes: pick(
                &self.max_field_value_bytes,
                &defaults.max_field_value_bytes,
            ),
            max_file_bytes: pick(&self.max_file_bytes, &defaults.max_file_bytes),
        }
    }

    /// Resolve against server-wide limits.
    pub fn limits(&self, server: &PayloadLimits) -> PayloadLimits {
        PayloadLimits {
            max_bytes: self.max_bytes.unwrap_or(server.max_bytes),
            max_parts: self.max_parts.unwrap_or(server.max_parts),
            max_fields: self.max_fields.unwrap_or(server.max_fields),
            max_files: self.max_files.unwrap_or(server.max_files),
            max_field_name_bytes: self
                .max_field_name_bytes
                .unwrap_or(server.max_field_name_bytes),
            max_field_value_bytes: self
                .max_field_value_bytes
                .unwrap_or(server.max_field_value_bytes),
            max_file_bytes: self.max_file_bytes.unwrap_or(server.max_file_bytes),
        }
    }
}

/// JSON Schema documents for the parts of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSchemas {
    pub params: Option<Value>,
    pub query: Option<Value>,
    pub headers: Option<Value>,
    pub body: Option<Value>,
}

impl ValidationSchemas {
    pub fn body(schema: Value) -> Self {
        Self {
            body: Some(schema),
            ..Self::default()
        }
    }

    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            params: pick(&self.params, &defaults.params),
            query: pick(&self.query, &defaults.query),
            headers: pick(&self.headers, &defaults.headers),
            body: pick(&self.body, &defaults.body),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_none() && self.query.is_none() && self.headers.is_none() && self.body.is_none()
    }
}

/// All option bundles a route (or a router's defaults) can carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    pub cache: Option<CacheOptions>,
    pub auth: Option<AuthOptions>,
    pub security: Option<SecurityOptions>,
    pub payload: Option<PayloadOptions>,
    pub validation: Option<ValidationSchemas>,
}

impl RouteOptions {
    /// Merge router defaults into these options; own values win.
    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            cache: merge_bundle(&self.cache, &defaults.cache, CacheOptions::merged_with),
            auth: merge_bundle(&self.auth, &defaults.auth, AuthOptions::merged_with),
            security: merge_bundle(&self.security, &defaults.security, SecurityOptions::merged_with),
            payload: merge_bundle(&self.payload, &defaults.payload, PayloadOptions::merged_with),
            validation: merge_bundle(
                &self.validation,
                &defaults.validation,
                ValidationSchemas::merged_with,
            ),
        }
    }
}
