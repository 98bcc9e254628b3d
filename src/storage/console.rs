//! Console storage backend: logs what would have been stored and refuses
//! every read/fullsync operation. Grounded on
//! `original_source/internal/store/console.go`.

use crate::config::StorageBackend as BackendConfig;
use crate::error::Result;
use crate::storage::traits::{unsupported, FullSyncUpload, ObjectStorage};
use async_trait::async_trait;
use tokio::io::AsyncRead;

pub struct ConsoleStorage {
    config: BackendConfig,
}

impl ConsoleStorage {
    pub fn new(config: BackendConfig) -> Self {
        ConsoleStorage { config }
    }
}

#[async_trait]
impl ObjectStorage for ConsoleStorage {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn store_entities(&self, encoded: Vec<u8>, recorded: Option<&str>, ext: &str) -> Result<()> {
        tracing::info!(
            dataset = %self.config.dataset,
            bytes = encoded.len(),
            recorded = recorded.unwrap_or("-"),
            ext,
            "console storage: would have stored entities"
        );
        Ok(())
    }

    async fn open_fullsync(&self) -> Result<Box<dyn FullSyncUpload>> {
        Err(unsupported("full sync not supported on dataset type"))
    }

    async fn get_entities(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        Err(unsupported("reading entities not supported on dataset type"))
    }

    async fn get_changes(&self, _since: Option<&str>) -> Result<(Box<dyn AsyncRead + Unpin + Send>, String)> {
        Err(unsupported("reading changes not supported on dataset type"))
    }
}
