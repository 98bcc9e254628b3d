//! Per-dataset full-sync session state machine: lazy TTL expiration
//! checked on access rather than a background sweep task, one
//! `tokio::sync::Mutex` slot per dataset so a write can hold its slot
//! across the upload's own await points.
//!
//! Each session owns a long-lived `Encoder` so stateful formats —
//! Parquet's row-group accumulation in particular — stay correct across a
//! sequence of write requests, not just within one. The encoder writes
//! into a shared in-memory sink; after each batch the sink is drained and
//! handed to the upload side as one chunk. A single task awaiting the
//! upload before returning gives blocking back-pressure on the caller
//! without a separate uploader task or channel.

use crate::codec::{self, Encoder};
use crate::entity::{Context, Entity};
use crate::error::{DatalayerError, Result};
use crate::storage::traits::{FullSyncUpload, ObjectStorage};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as TokioMutex;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const WRITE_DEADLINE: Duration = Duration::from_secs(60);

/// A `std::io::Write` sink shared between the (synchronous) encoder and
/// the (asynchronous) per-write drain step.
#[derive(Clone, Default)]
pub(crate) struct SharedSink(Arc<StdMutex<Vec<u8>>>);

impl SharedSink {
    pub(crate) fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ActiveSession {
    session_id: String,
    encoder: Option<Box<dyn Encoder + Send>>,
    sink: SharedSink,
    upload: Box<dyn FullSyncUpload>,
    last_activity: Instant,
}

#[derive(Default)]
struct Slot {
    session: Option<ActiveSession>,
}

/// One table of full-sync slots, one per dataset name, shared by the
/// storage engine across every request.
#[derive(Default)]
pub struct FullSyncTable {
    slots: RwLock<HashMap<String, Arc<TokioMutex<Slot>>>>,
}

impl FullSyncTable {
    pub fn new() -> Self {
        FullSyncTable::default()
    }

    fn slot_for(&self, dataset: &str) -> Arc<TokioMutex<Slot>> {
        if let Some(slot) = self.slots.read().get(dataset) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(dataset.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(Slot::default())))
            .clone()
    }

    /// `Idle + start` and `Active + start(id=Y)` both land here: any
    /// existing session for this dataset is aborted first, then a fresh
    /// one is opened against `backend`.
    pub async fn start(&self, backend: &dyn ObjectStorage, dataset: &str, session_id: &str) -> Result<()> {
        let slot = self.slot_for(dataset);
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.session.take() {
            drop(existing.encoder);
            let _ = existing.upload.abort().await;
        }
        let upload = backend.open_fullsync().await?;
        let sink = SharedSink::default();
        let encoder = codec::build_encoder(backend.config(), sink.clone())?;
        guard.session = Some(ActiveSession {
            session_id: session_id.to_string(),
            encoder: Some(encoder),
            sink,
            upload,
            last_activity: Instant::now(),
        });
        Ok(())
    }

    fn check_session<'a>(guard: &'a mut Slot, session_id: &str) -> Result<&'a mut ActiveSession> {
        match &guard.session {
            Some(s) if s.session_id == session_id => {}
            Some(_) => return Err(DatalayerError::SessionConflict("wrong session id".to_string())),
            None => return Err(DatalayerError::SessionConflict("no session open".to_string())),
        }
        Ok(guard.session.as_mut().unwrap())
    }

    async fn expire_if_idle(guard: &mut Slot) {
        let idle = guard
            .session
            .as_ref()
            .map(|s| s.last_activity.elapsed() > IDLE_TIMEOUT)
            .unwrap_or(false);
        if idle {
            if let Some(s) = guard.session.take() {
                drop(s.encoder);
                let _ = s.upload.abort().await;
            }
        }
    }

    /// `Active + (start=false, id=X)`. Expires an idle session lazily on
    /// access rather than via a background timer.
    pub async fn write(&self, dataset: &str, session_id: &str, batch: Vec<Entity>, ctx: Context) -> Result<()> {
        let slot = self.slot_for(dataset);
        let mut guard = slot.lock().await;
        Self::expire_if_idle(&mut guard).await;

        {
            let state = Self::check_session(&mut guard, session_id)?;
            let encoder = state.encoder.as_mut().expect("session encoder missing before finish");
            encoder.write_batch(&batch, &ctx)?;
        }

        let chunk = guard.session.as_ref().unwrap().sink.drain();
        if chunk.is_empty() {
            guard.session.as_mut().unwrap().last_activity = Instant::now();
            return Ok(());
        }

        let outcome = {
            let state = guard.session.as_mut().unwrap();
            tokio::time::timeout(WRITE_DEADLINE, state.upload.write_chunk(Bytes::from(chunk))).await
        };

        match outcome {
            Ok(Ok(())) => {
                guard.session.as_mut().unwrap().last_activity = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => {
                if let Some(s) = guard.session.take() {
                    drop(s.encoder);
                    let _ = s.upload.abort().await;
                }
                Err(e)
            }
            Err(_elapsed) => {
                if let Some(s) = guard.session.take() {
                    drop(s.encoder);
                    let _ = s.upload.abort().await;
                }
                Err(DatalayerError::Timeout("full-sync write deadline exceeded".to_string()))
            }
        }
    }

    /// `Active + (end=true, id=X)`. Flushes the encoder's tail state,
    /// uploads any remaining bytes, commits, and returns the slot to
    /// `Idle`.
    pub async fn end(&self, dataset: &str, session_id: &str) -> Result<()> {
        let slot = self.slot_for(dataset);
        let mut guard = slot.lock().await;
        Self::expire_if_idle(&mut guard).await;
        Self::check_session(&mut guard, session_id)?;

        let mut state = guard.session.take().unwrap();
        let encoder = state.encoder.take().expect("session encoder missing before finish");
        if let Err(e) = encoder.finish() {
            let _ = state.upload.abort().await;
            return Err(e);
        }

        let tail = state.sink.drain();
        if !tail.is_empty() {
            if let Err(e) = state.upload.write_chunk(Bytes::from(tail)).await {
                let _ = state.upload.abort().await;
                return Err(e);
            }
        }

        state.upload.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageBackend as BackendConfig, StorageProps, StorageType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncRead;

    struct RecordingUpload {
        chunks: Arc<AtomicUsize>,
        committed: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
        stall: bool,
    }

    #[async_trait]
    impl FullSyncUpload for RecordingUpload {
        async fn write_chunk(&mut self, _bytes: Bytes) -> Result<()> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.chunks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn commit(self: Box<Self>) -> Result<()> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn abort(self: Box<Self>) -> Result<()> {
            self.aborted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeBackend {
        config: BackendConfig,
        stall: bool,
        chunks: Arc<AtomicUsize>,
        committed: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ObjectStorage for FakeBackend {
        fn config(&self) -> &BackendConfig {
            &self.config
        }
        async fn store_entities(&self, _: Vec<u8>, _: Option<&str>, _: &str) -> Result<()> {
            Ok(())
        }
        async fn open_fullsync(&self) -> Result<Box<dyn FullSyncUpload>> {
            Ok(Box::new(RecordingUpload {
                chunks: self.chunks.clone(),
                committed: self.committed.clone(),
                aborted: self.aborted.clone(),
                stall: self.stall,
            }))
        }
        async fn get_entities(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
            Err(DatalayerError::Unsupported("n/a".into()))
        }
        async fn get_changes(&self, _: Option<&str>) -> Result<(Box<dyn AsyncRead + Unpin + Send>, String)> {
            Err(DatalayerError::Unsupported("n/a".into()))
        }
    }

    fn backend(stall: bool) -> (FakeBackend, Arc<AtomicUsize>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let chunks = Arc::new(AtomicUsize::new(0));
        let committed = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));
        let cfg = BackendConfig {
            dataset: "ds".to_string(),
            storage_type: StorageType::S3,
            strip_props: false,
            store_deleted: false,
            resolve_namespace: false,
            athena_compatible: false,
            csv: None,
            flat_file: None,
            parquet: None,
            decode: Default::default(),
            props: StorageProps::default(),
            ordering: Default::default(),
        };
        (
            FakeBackend {
                config: cfg,
                stall,
                chunks: chunks.clone(),
                committed: committed.clone(),
                aborted: aborted.clone(),
            },
            chunks,
            committed,
            aborted,
        )
    }

    fn one_entity_batch() -> Vec<Entity> {
        vec![Entity::new("a:1")]
    }

    #[tokio::test]
    async fn start_write_end_happy_path() {
        let (backend, chunks, committed, _aborted) = backend(false);
        let table = FullSyncTable::new();
        table.start(&backend, "ds", "42").await.unwrap();
        table.write("ds", "42", one_entity_batch(), Context::empty()).await.unwrap();
        table.write("ds", "42", one_entity_batch(), Context::empty()).await.unwrap();
        table.end("ds", "42").await.unwrap();
        // JSON encoder writes a leading `[entity` on the first batch and a
        // trailing `]` on finish; both became one chunk each plus the
        // comma-prefixed second batch, so at least the two writes landed.
        assert!(chunks.load(Ordering::SeqCst) >= 2);
        assert!(committed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn write_with_wrong_session_id_is_rejected() {
        let (backend, _c, _co, _a) = backend(false);
        let table = FullSyncTable::new();
        table.start(&backend, "ds", "42").await.unwrap();
        let err = table
            .write("ds", "43", one_entity_batch(), Context::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, DatalayerError::SessionConflict(_)));
    }

    #[tokio::test]
    async fn write_without_a_session_is_rejected() {
        let table = FullSyncTable::new();
        let err = table
            .write("ds", "1", one_entity_batch(), Context::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, DatalayerError::SessionConflict(_)));
    }

    #[tokio::test]
    async fn new_start_aborts_the_previous_session() {
        let (backend, _c, _co, aborted) = backend(false);
        let table = FullSyncTable::new();
        table.start(&backend, "ds", "42").await.unwrap();
        table.start(&backend, "ds", "43").await.unwrap();
        assert!(aborted.load(Ordering::SeqCst));
        assert!(table
            .write("ds", "42", one_entity_batch(), Context::empty())
            .await
            .is_err());
        assert!(table
            .write("ds", "43", one_entity_batch(), Context::empty())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out_and_aborts() {
        let (backend, _c, _co, aborted) = backend(true);
        let table = FullSyncTable::new();
        table.start(&backend, "ds", "42").await.unwrap();

        let write_fut = table.write("ds", "42", one_entity_batch(), Context::empty());
        tokio::pin!(write_fut);
        tokio::time::advance(Duration::from_secs(61)).await;
        let err = write_fut.await.unwrap_err();
        assert!(matches!(err, DatalayerError::Timeout(_)));
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn end_after_idle_timeout_is_rejected() {
        let (backend, _c, committed, _aborted) = backend(false);
        let table = FullSyncTable::new();
        table.start(&backend, "ds", "42").await.unwrap();
        tokio::time::advance(Duration::from_secs(30 * 60 + 1)).await;
        let err = table.end("ds", "42").await.unwrap_err();
        assert!(matches!(err, DatalayerError::SessionConflict(_)));
        assert!(!committed.load(Ordering::SeqCst));
    }
}
