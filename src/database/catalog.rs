use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Every schema that should be backed up, system schemas already removed.
    async fn list_databases(&self) -> Result<Vec<String>>;
}
