use async_trait::async_trait;
use serde_json::Value;

use crate::core::{error::HandlerResult, request::Request, response::Response};

/// Template rendering collaborator. The dispatcher never calls it; handlers
/// hold a provider and render through it.
#[async_trait]
pub trait ViewProvider: Send + Sync + 'static {
    /// Render `template` with optional `data` into `res`.
    async fn render(
        &self,
        req: &Request,
        res: &mut Response,
        template: &str,
        data: Option<Value>,
    ) -> HandlerResult;
}
