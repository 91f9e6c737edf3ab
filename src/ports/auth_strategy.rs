use std::collections::HashMap;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::request::Request;

/// Outcome of an authentication attempt, attached to the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    pub authenticated: bool,
    /// Name of the strategy that authenticated the request.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub claims: HashMap<String, Value>,
}

impl AuthResult {
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    pub fn authenticated(principal: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            principal: Some(principal.into()),
            ..Self::default()
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// A named way of authenticating a request (cookie, header, query token...).
///
/// Implementations only read the request; the dispatcher records the result.
#[async_trait]
pub trait AuthStrategy: Send + Sync + 'static {
    /// Inspect the request and report whether it carries valid credentials.
    ///
    /// An `Err` is logged and treated like a failed attempt, so the next
    /// strategy still gets a chance.
    async fn authenticate(&self, req: &Request) -> Result<AuthResult>;
}
