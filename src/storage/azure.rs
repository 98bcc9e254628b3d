//! Azure Blob storage backend (spec §4.9): block-blob uploads for the
//! incremental path, ranged reads for snapshot/change reads. Fullsync is
//! not supported — only S3 streams a multipart upload (scenario b).

use crate::config::{AuthType, StorageBackend as BackendConfig};
use crate::error::{DatalayerError, Result};
use crate::storage::keygen;
use crate::storage::traits::{unsupported, FullSyncUpload, ObjectStorage};
use async_trait::async_trait;
use azure_storage::prelude::*;
use azure_storage_blobs::prelude::*;
use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tracing::info;

pub struct AzureStorage {
    container: ContainerClient,
    config: BackendConfig,
}

impl AzureStorage {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let account = config
            .props
            .bucket
            .clone()
            .ok_or_else(|| DatalayerError::Config("azure dataset missing props.bucket (account name)".to_string()))?;
        let container_name = config
            .props
            .root_folder
            .clone()
            .unwrap_or_else(|| config.dataset.clone());

        let credentials = match config.props.auth_type {
            Some(AuthType::Sas) => {
                let token = config
                    .props
                    .secret
                    .clone()
                    .ok_or_else(|| DatalayerError::Config("azure SAS auth missing props.secret".to_string()))?;
                StorageCredentials::sas_token(token)
                    .map_err(|e| DatalayerError::Config(format!("invalid azure sas token: {e}")))?
            }
            _ => {
                let key = config
                    .props
                    .secret
                    .clone()
                    .ok_or_else(|| DatalayerError::Config("azure static auth missing props.secret".to_string()))?;
                StorageCredentials::access_key(account.clone(), key)
            }
        };

        let service = BlobServiceClient::new(account, credentials);
        let container = service.container_client(container_name);

        Ok(AzureStorage { container, config })
    }

    async fn read_blob(&self, key: &str) -> Result<Vec<u8>> {
        let blob = self.container.blob_client(key);
        let mut stream = blob.get().into_stream();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DatalayerError::UpstreamIo(format!("get blob {key}: {e}")))?;
            let data = chunk
                .data
                .collect()
                .await
                .map_err(|e| DatalayerError::UpstreamIo(e.to_string()))?;
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    async fn list_sorted(&self, prefix: &str) -> Result<Vec<(time::OffsetDateTime, String)>> {
        let mut out = Vec::new();
        let mut pages = self.container.list_blobs().prefix(prefix.to_string()).into_stream();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| DatalayerError::UpstreamIo(format!("list_blobs: {e}")))?;
            for blob in page.blobs.blobs() {
                out.push((blob.properties.last_modified, blob.name.clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(out)
    }

    async fn concat(&self, keys: &[String]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for k in keys {
            buf.extend(self.read_blob(k).await?);
        }
        Ok(buf)
    }
}

#[async_trait]
impl ObjectStorage for AzureStorage {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn store_entities(&self, encoded: Vec<u8>, recorded: Option<&str>, ext: &str) -> Result<()> {
        let key = keygen::object_key(&self.config, "changes", recorded, ext, Utc::now());
        self.container
            .blob_client(&key)
            .put_block_blob(encoded)
            .await
            .map_err(|e| DatalayerError::UpstreamIo(format!("put_block_blob {key}: {e}")))?;
        info!(%key, "stored entities in azure blob storage");
        Ok(())
    }

    async fn open_fullsync(&self) -> Result<Box<dyn FullSyncUpload>> {
        Err(unsupported("full sync not supported on dataset type"))
    }

    async fn get_entities(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let bytes = if let Some(fixed) = keygen::fullsync_resource_path(&self.config) {
            self.read_blob(&fixed).await?
        } else {
            let prefix = format!("{}entities", keygen::dataset_prefix(&self.config.dataset));
            let files = self.list_sorted(&prefix).await?;
            let keys: Vec<String> = files.into_iter().map(|(_, k)| k).collect();
            self.concat(&keys).await?
        };
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn get_changes(&self, since: Option<&str>) -> Result<(Box<dyn AsyncRead + Unpin + Send>, String)> {
        let prefix = format!("{}changes", keygen::dataset_prefix(&self.config.dataset));
        let files = self.list_sorted(&prefix).await?;

        let since_unix_nanos = since.filter(|s| !s.is_empty()).and_then(|s| s.parse::<i128>().ok());

        let mut selected = Vec::new();
        let mut max_nanos = since_unix_nanos.unwrap_or(0);
        for (modified, key) in files {
            let nanos = modified.unix_timestamp_nanos();
            if since_unix_nanos.map(|s| nanos > s).unwrap_or(true) {
                selected.push(key);
                if nanos > max_nanos {
                    max_nanos = nanos;
                }
            }
        }

        let bytes = self.concat(&selected).await?;
        Ok((Box::new(std::io::Cursor::new(bytes)), max_nanos.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageProps, StorageType};

    fn cfg() -> BackendConfig {
        BackendConfig {
            dataset: "azure-ds".to_string(),
            storage_type: StorageType::Azure,
            strip_props: false,
            store_deleted: false,
            resolve_namespace: false,
            athena_compatible: false,
            csv: None,
            flat_file: None,
            parquet: None,
            decode: Default::default(),
            props: StorageProps {
                bucket: Some("myaccount".to_string()),
                secret: Some("key".to_string()),
                ..Default::default()
            },
            ordering: Default::default(),
        }
    }

    #[test]
    fn new_succeeds_with_access_key_credentials() {
        assert!(AzureStorage::new(cfg()).is_ok());
    }

    #[test]
    fn new_rejects_missing_account() {
        let mut c = cfg();
        c.props.bucket = None;
        assert!(AzureStorage::new(c).is_err());
    }

    #[tokio::test]
    async fn fullsync_is_unsupported() {
        let backend = AzureStorage::new(cfg()).unwrap();
        assert!(backend.open_fullsync().await.is_err());
    }
}
