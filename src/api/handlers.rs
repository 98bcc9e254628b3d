//! Dataset dispatch handlers (spec §4.11): enumerate datasets, ingest
//! entities (plain or full-sync), and read snapshots/change feeds back.

use crate::api::stream;
use crate::codec;
use crate::entity::{parse_stream, Entity};
use crate::error::Result;
use crate::storage::session::SharedSink;
use crate::storage::StorageEngine;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub struct AppState {
    pub engine: Arc<StorageEngine>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/datasets", get(list_datasets))
        .route("/datasets/:name/entities", get(get_entities).post(post_entities))
        .route("/datasets/:name/changes", get(get_changes))
        .with_state(state)
}

#[derive(Serialize)]
struct DatasetInfo {
    name: String,
    #[serde(rename = "type")]
    methods: Vec<&'static str>,
}

async fn list_datasets(State(state): State<Arc<AppState>>) -> Json<Vec<DatasetInfo>> {
    let datasets = state
        .engine
        .dataset_names()
        .into_iter()
        .map(|name| DatasetInfo {
            name,
            methods: vec!["POST"],
        })
        .collect();
    Json(datasets)
}

const HEADER_START: &str = "universal-data-api-full-sync-start";
const HEADER_END: &str = "universal-data-api-full-sync-end";
const HEADER_ID: &str = "universal-data-api-full-sync-id";

fn header_is_true(headers: &HeaderMap, name: &str) -> bool {
    headers.get(name).and_then(|v| v.to_str().ok()) == Some("true")
}

#[derive(Debug, Deserialize, Default)]
struct IngestQuery {
    #[serde(rename = "batchSize")]
    batch_size: Option<usize>,
}

fn first_recorded(batch: &[Entity]) -> Option<String> {
    batch.first().and_then(|e| e.recorded.clone())
}

async fn post_entities(
    State(state): State<Arc<AppState>>,
    Path(dataset): Path<String>,
    Query(query): Query<IngestQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode> {
    let backend = state.engine.backend_for(&dataset).await?;
    let batch_size = query.batch_size.unwrap_or(0);
    let store_deleted = backend.config().store_deleted;

    let session_id = headers.get(HEADER_ID).and_then(|v| v.to_str().ok()).map(str::to_string);

    if let Some(session_id) = session_id {
        let start = header_is_true(&headers, HEADER_START);
        let end = header_is_true(&headers, HEADER_END);

        if start {
            state.engine.sessions().start(backend.as_ref(), &dataset, &session_id).await?;
        }

        let body_cursor = std::io::Cursor::new(body.to_vec());
        parse_stream(body_cursor, batch_size, store_deleted, |batch, ctx| {
            let sessions = state.engine.sessions();
            let dataset = dataset.clone();
            let session_id = session_id.clone();
            async move { sessions.write(&dataset, &session_id, batch, ctx).await }
        })
        .await?;

        if end {
            state.engine.sessions().end(&dataset, &session_id).await?;
        }

        return Ok(StatusCode::OK);
    }

    let ext = codec::extension(backend.config());
    let body_cursor = std::io::Cursor::new(body.to_vec());
    parse_stream(body_cursor, batch_size, store_deleted, |batch, ctx| {
        let backend = backend.clone();
        async move {
            let recorded = first_recorded(&batch);
            let sink = SharedSink::default();
            {
                let mut encoder = codec::build_encoder(backend.config(), sink.clone())?;
                encoder.write_batch(&batch, &ctx)?;
                encoder.finish()?;
            }
            let buf = sink.drain();
            backend.store_entities(buf, recorded.as_deref(), ext).await
        }
    })
    .await?;

    info!(%dataset, "stored incremental batch");
    Ok(StatusCode::OK)
}

async fn get_entities(
    State(state): State<Arc<AppState>>,
    Path(dataset): Path<String>,
) -> Result<Response> {
    let backend = state.engine.backend_for(&dataset).await?;
    let reader = backend.get_entities().await?;
    stream::respond(reader, backend.config().clone(), None).await
}

#[derive(Debug, Deserialize, Default)]
struct ChangesQuery {
    since: Option<String>,
}

async fn get_changes(
    State(state): State<Arc<AppState>>,
    Path(dataset): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Response> {
    let backend = state.engine.backend_for(&dataset).await?;
    let since = query
        .since
        .as_deref()
        .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()));

    let (reader, token) = backend.get_changes(since.as_deref()).await?;
    stream::respond(reader, backend.config().clone(), Some(token)).await
}
