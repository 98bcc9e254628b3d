//! Streams a dataset read response straight from the backend reader into
//! the HTTP body instead of materializing it first (spec §1, §5, §9):
//! JSON, NDJSON, CSV, and FlatFile all decode incrementally off the byte
//! stream. Parquet's footer-at-end layout leaves no alternative to a full
//! read before any row can be decoded (spec §4.6), so it stays the one
//! path that buffers the whole object.

use crate::codec::{self, csv as csv_codec, flatfile as flatfile_codec, json as json_codec, ndjson as ndjson_codec};
use crate::config::{CodecKind, StorageBackend as BackendConfig};
use crate::entity::{Context, Entity};
use crate::error::{DatalayerError, Result};
use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;

const READ_CHUNK: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 16;

/// Decode `reader` per `config`'s codec and stream `[context, entity*,
/// continuation?]` straight into the HTTP response body.
pub async fn respond(
    reader: Box<dyn AsyncRead + Unpin + Send>,
    config: BackendConfig,
    continuation_token: Option<String>,
) -> Result<Response> {
    if config.codec_kind() == CodecKind::Parquet {
        return materialize(reader, &config, continuation_token.as_deref()).await;
    }

    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, DatalayerError>>(CHANNEL_CAPACITY);
    tokio::spawn(decode_and_send(reader, config, continuation_token, tx));

    let body_stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    Ok((StatusCode::OK, [("content-type", "application/json")], Body::from_stream(body_stream)).into_response())
}

/// The one codec that can't stream: Parquet's footer lives at the end of
/// the file, so the decoder needs the whole object before it can read a
/// single row.
async fn materialize(
    mut reader: Box<dyn AsyncRead + Unpin + Send>,
    config: &BackendConfig,
    continuation_token: Option<&str>,
) -> Result<Response> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    let (ctx, entities) = codec::decode(config, bytes)?;
    let mut out = Vec::new();
    codec::write_json_array(&mut out, &ctx, entities, continuation_token)?;
    Ok((StatusCode::OK, [("content-type", "application/json")], out).into_response())
}

/// Writes the `[context, entity*, continuation?]` array one value at a
/// time onto the response channel, prefixing every value after the first
/// with a comma.
struct JsonArraySender {
    tx: mpsc::Sender<std::result::Result<Bytes, DatalayerError>>,
    wrote_any: bool,
}

impl JsonArraySender {
    fn new(tx: mpsc::Sender<std::result::Result<Bytes, DatalayerError>>) -> Self {
        JsonArraySender { tx, wrote_any: false }
    }

    async fn open(&self) -> bool {
        self.tx.send(Ok(Bytes::from_static(b"["))).await.is_ok()
    }

    async fn write_value(&mut self, value: &impl Serialize) -> Result<()> {
        let mut buf = Vec::new();
        if self.wrote_any {
            buf.push(b',');
        }
        self.wrote_any = true;
        serde_json::to_writer(&mut buf, value)?;
        self.tx
            .send(Ok(Bytes::from(buf)))
            .await
            .map_err(|_| DatalayerError::Downstream("client disconnected".to_string()))
    }
}

async fn decode_and_send(
    mut reader: Box<dyn AsyncRead + Unpin + Send>,
    config: BackendConfig,
    continuation_token: Option<String>,
    tx: mpsc::Sender<std::result::Result<Bytes, DatalayerError>>,
) {
    let mut sender = JsonArraySender::new(tx);
    if !sender.open().await {
        return;
    }
    if sender.write_value(&Context::empty()).await.is_err() {
        return;
    }

    let result = match config.codec_kind() {
        CodecKind::Json => stream_json(&mut *reader, &mut sender).await,
        CodecKind::Ndjson => stream_ndjson(&mut *reader, &config, &mut sender).await,
        CodecKind::FlatFile => stream_flatfile(&mut *reader, &config, &mut sender).await,
        CodecKind::Csv => stream_csv(reader, &config, &mut sender).await,
        CodecKind::Parquet => unreachable!("parquet takes the materialize path in respond()"),
    };

    if let Err(e) = result {
        // The response has already started; per spec §7 a read error
        // mid-stream closes the pipe with an error instead of finishing
        // the array, so the client sees a truncated, detectably invalid
        // body rather than a silently-short one.
        let _ = sender.tx.send(Err(e)).await;
        return;
    }

    if let Some(token) = &continuation_token {
        if sender.write_value(&crate::entity::Continuation::new(token.as_str())).await.is_err() {
            return;
        }
    }
    let _ = sender.tx.send(Ok(Bytes::from_static(b"]"))).await;
}

async fn stream_json(reader: &mut (dyn AsyncRead + Unpin + Send), sender: &mut JsonArraySender) -> Result<()> {
    let mut decoder = json_codec::JsonStreamDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for entity in decoder.feed(&chunk[..n])? {
            sender.write_value(&entity).await?;
        }
    }
    Ok(())
}

async fn stream_ndjson(
    reader: &mut (dyn AsyncRead + Unpin + Send),
    config: &BackendConfig,
    sender: &mut JsonArraySender,
) -> Result<()> {
    let mut decoder = ndjson_codec::NdjsonStreamDecoder::new(config.decode.clone());
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for entity in decoder.feed(&chunk[..n])? {
            sender.write_value(&entity).await?;
        }
    }
    for entity in decoder.finish()? {
        sender.write_value(&entity).await?;
    }
    Ok(())
}

async fn stream_flatfile(
    reader: &mut (dyn AsyncRead + Unpin + Send),
    config: &BackendConfig,
    sender: &mut JsonArraySender,
) -> Result<()> {
    let mut decoder =
        flatfile_codec::FlatFileStreamDecoder::new(config.flat_file.clone().unwrap_or_default(), config.decode.clone());
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for entity in decoder.feed(&chunk[..n])? {
            sender.write_value(&entity).await?;
        }
    }
    for entity in decoder.finish()? {
        sender.write_value(&entity).await?;
    }
    Ok(())
}

/// The `csv` crate only parses synchronous `std::io::Read`, so the bridged
/// reader and parse loop run inside `spawn_blocking`, shipping decoded
/// entities out over a channel as they're produced.
async fn stream_csv(
    reader: Box<dyn AsyncRead + Unpin + Send>,
    config: &BackendConfig,
    sender: &mut JsonArraySender,
) -> Result<()> {
    let sync_reader = SyncIoBridge::new(reader);
    let csv_cfg = config.csv.clone().unwrap_or_default();
    let decode_cfg = config.decode.clone();
    let (entity_tx, mut entity_rx) = mpsc::channel::<Entity>(CHANNEL_CAPACITY);

    let parse_task = tokio::task::spawn_blocking(move || {
        csv_codec::decode_with(sync_reader, &csv_cfg, &decode_cfg, |entity| {
            entity_tx
                .blocking_send(entity)
                .map_err(|_| DatalayerError::Downstream("response channel closed".to_string()))
        })
    });

    while let Some(entity) = entity_rx.recv().await {
        sender.write_value(&entity).await?;
    }

    parse_task
        .await
        .map_err(|e| DatalayerError::UpstreamIo(format!("csv decode task panicked: {e}")))??;
    Ok(())
}
