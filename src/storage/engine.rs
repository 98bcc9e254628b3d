//! Per-process backend cache and full-sync session table: one backend
//! instance per dataset, built lazily and reused, behind a read-mostly
//! map-under-a-lock (see `DESIGN.md`).

use crate::config::{ConfigurationManager, StorageType};
use crate::error::{DatalayerError, Result};
use crate::storage::session::FullSyncTable;
use crate::storage::traits::ObjectStorage;
use crate::storage::{azure, console, local, s3};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct StorageEngine {
    config: Arc<ConfigurationManager>,
    local_root: PathBuf,
    backends: RwLock<HashMap<String, Arc<dyn ObjectStorage>>>,
    sessions: FullSyncTable,
}

impl StorageEngine {
    pub fn new(config: Arc<ConfigurationManager>, local_root: impl Into<PathBuf>) -> Self {
        StorageEngine {
            config,
            local_root: local_root.into(),
            backends: RwLock::new(HashMap::new()),
            sessions: FullSyncTable::new(),
        }
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.config.current().datasets.iter().map(|d| d.dataset.clone()).collect()
    }

    pub fn sessions(&self) -> &FullSyncTable {
        &self.sessions
    }

    /// Returns the cached backend for `dataset`, constructing and caching
    /// one on first access. Config changes that swap a dataset's
    /// `storageType` are picked up on process restart — this cache is
    /// build-once, not wired into the config reload machinery.
    pub async fn backend_for(&self, dataset: &str) -> Result<Arc<dyn ObjectStorage>> {
        if let Some(existing) = self.backends.read().get(dataset) {
            return Ok(existing.clone());
        }

        let snapshot = self.config.current();
        let backend_cfg = snapshot
            .by_name(dataset)
            .ok_or_else(|| DatalayerError::UnknownDataset(dataset.to_string()))?
            .clone();

        let backend: Arc<dyn ObjectStorage> = match backend_cfg.storage_type {
            StorageType::S3 => Arc::new(s3::S3Storage::new(backend_cfg).await?),
            StorageType::Azure => Arc::new(azure::AzureStorage::new(backend_cfg)?),
            StorageType::Localstorage => Arc::new(local::LocalStorage::new(backend_cfg, self.local_root.clone())),
            StorageType::Console => Arc::new(console::ConsoleStorage::new(backend_cfg)),
        };

        self.backends.write().insert(dataset.to_string(), backend.clone());
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend as BackendConfig;

    async fn manager_with(datasets: Vec<BackendConfig>) -> Arc<ConfigurationManager> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let doc = crate::config::StorageConfig { datasets };
        tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap()).await.unwrap();
        let mgr = ConfigurationManager::load(format!("file://{}", path.display())).await.unwrap();
        drop(dir);
        Arc::new(mgr)
    }

    fn console_backend(name: &str) -> BackendConfig {
        BackendConfig {
            dataset: name.to_string(),
            storage_type: StorageType::Console,
            strip_props: false,
            store_deleted: false,
            resolve_namespace: false,
            athena_compatible: false,
            csv: None,
            flat_file: None,
            parquet: None,
            decode: Default::default(),
            props: Default::default(),
            ordering: Default::default(),
        }
    }

    #[tokio::test]
    async fn unknown_dataset_is_an_error() {
        let mgr = manager_with(vec![console_backend("a")]).await;
        let engine = StorageEngine::new(mgr, ".");
        assert!(engine.backend_for("missing").await.is_err());
    }

    #[tokio::test]
    async fn backend_is_cached_across_calls() {
        let mgr = manager_with(vec![console_backend("a")]).await;
        let engine = StorageEngine::new(mgr, ".");
        let first = engine.backend_for("a").await.unwrap();
        let second = engine.backend_for("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn dataset_names_reflects_the_config_snapshot() {
        let mgr = manager_with(vec![console_backend("a"), console_backend("b")]).await;
        let engine = StorageEngine::new(mgr, ".");
        let mut names = engine.dataset_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
