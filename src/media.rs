//! Media/asset service contract (consumed). spec.md §6.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Asset {
    pub id: String,
    pub mime: String,
    pub storage_key: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub enum MediaInput {
    Bytes { data: Vec<u8>, mime: Option<String>, name: Option<String> },
    Url(String),
}

#[async_trait]
pub trait MediaService: Send + Sync {
    /// Returns `ChannelError::AssetTooLarge` when the input exceeds the
    /// service's size cap; the caller keeps the original attachment and
    /// continues, per spec.md §4.4 step 3 / §7.
    async fn ingest(&self, input: MediaInput) -> Result<Asset>;

    fn access_path(&self, asset: &Asset) -> String;

    async fn get_by_storage_key(&self, _storage_key: &str) -> Result<Option<Asset>> {
        Ok(None)
    }

    async fn ingest_container_file(&self, _path: &str) -> Result<Asset> {
        Err(crate::error::ChannelError::Other(anyhow::anyhow!(
            "ingest_container_file is not supported by this media service"
        )))
    }
}
