//! The backend-agnostic storage interface: async methods for incremental
//! writes, change-feed reads, fullsync snapshot reads, and fullsync
//! upload sessions (see `DESIGN.md`).

use crate::config::StorageBackend as BackendConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

/// One open fullsync upload. Only the S3 backend can produce one (spec
/// §4.10, scenario b) — everything else's `open_fullsync` returns
/// `Unsupported`.
#[async_trait]
pub trait FullSyncUpload: Send {
    async fn write_chunk(&mut self, bytes: Bytes) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    /// Abort without finalizing a partial object — for backends that
    /// support atomic multipart abort (spec §7).
    async fn abort(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn config(&self) -> &BackendConfig;

    /// Incremental write: `batch` is already encoded; upload it as one new
    /// object under `changes/…` (spec §4.9).
    async fn store_entities(&self, encoded: Vec<u8>, recorded: Option<&str>, ext: &str) -> Result<()>;

    async fn open_fullsync(&self) -> Result<Box<dyn FullSyncUpload>>;

    /// Fullsync snapshot reader: the fixed resource if configured, else
    /// every `entities/…` object concatenated oldest write first.
    async fn get_entities(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>>;

    /// Incremental change feed: every `changes/…` object with
    /// `modTime > since`, concatenated, plus the max observed `modTime` as
    /// the next continuation token.
    async fn get_changes(&self, since: Option<&str>) -> Result<(Box<dyn AsyncRead + Unpin + Send>, String)>;
}

pub fn unsupported(what: &str) -> crate::error::DatalayerError {
    crate::error::DatalayerError::Unsupported(what.to_string())
}
