use async_trait::async_trait;
use eyre::Result;

/// A dependent resource (database pool, cache client...) whose lifetime is
/// tied to the server: created on start, destroyed during shutdown.
#[async_trait]
pub trait DataProvider: Send + Sync + 'static {
    /// Name used in lifecycle logs and shutdown reports.
    fn name(&self) -> &str;

    /// Acquire the underlying resource.
    async fn create(&self) -> Result<()>;

    /// Release the resource. Failures are collected, never fatal.
    async fn destroy(&self) -> Result<()> {
        Ok(())
    }
}
