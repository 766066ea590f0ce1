//! Source-provider boundary.
//!
//! Remote photo and drive services are external collaborators; this trait
//! is the whole contract the pipeline relies on. Provider implementations
//! (and their credential handling) live outside this crate. The cache's
//! logical id is the provider-assigned item id.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One retrievable item in a source container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    /// Provider-assigned stable id; used as the cache logical id.
    pub id: String,
    pub name: String,
    /// Size in bytes when the provider reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A remote container of receipt images (album, folder, bucket).
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Provider name for logs and status output.
    fn name(&self) -> &str;

    /// List items in the given container.
    async fn list_items(&self, container_id: &str) -> Result<Vec<SourceItem>>;

    /// Download one item's bytes.
    async fn download(&self, id: &str) -> Result<Vec<u8>>;
}
