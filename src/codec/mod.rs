//! Format codec matrix (spec §4.3-§4.6): five bidirectional adapters
//! sharing the lowering layer in `crate::lowering`.

pub mod athena;
pub mod csv;
pub mod flatfile;
pub mod json;
pub mod ndjson;
pub mod ordering;
pub mod parquet;

use crate::config::StorageBackend;
use crate::entity::{Context, Entity};
use crate::error::Result;

/// Implemented by every format's writer side. `write_batch` may be called
/// any number of times (fullsync sessions feed it one request body at a
/// time); `finish` flushes any buffered tail state (row-group footer,
/// closing bracket, …) and consumes the encoder.
pub trait Encoder {
    fn write_batch(&mut self, batch: &[Entity], ctx: &Context) -> Result<()>;
    /// Flush any buffered tail state (row-group footer, closing bracket,
    /// …) and finalize. Consumes the encoder — the underlying writer (a
    /// pipe or in-memory buffer) is never handed back, matching the
    /// columnar writer's own `close()` contract.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// File extension used when composing an object key for this codec
/// (spec §4.8).
pub fn extension(backend: &StorageBackend) -> &'static str {
    use crate::config::CodecKind;
    match backend.codec_kind() {
        CodecKind::Parquet => "parquet",
        CodecKind::Csv => "csv",
        CodecKind::FlatFile => "txt",
        CodecKind::Json | CodecKind::Ndjson => "json",
    }
}

/// Build an encoder for the dataset's configured format, writing into `w`.
pub fn build_encoder<W: std::io::Write + Send + 'static>(
    backend: &StorageBackend,
    w: W,
) -> Result<Box<dyn Encoder + Send>> {
    use crate::config::CodecKind;
    match backend.codec_kind() {
        CodecKind::Json => Ok(Box::new(json::JsonEncoder::new(w, backend.strip_props))),
        CodecKind::Ndjson => Ok(Box::new(ndjson::NdjsonEncoder::new(w, backend.resolve_namespace))),
        CodecKind::Csv => Ok(Box::new(csv::CsvEncoder::new(
            w,
            backend.csv.clone().unwrap_or_default(),
        ))),
        CodecKind::FlatFile => Ok(Box::new(flatfile::FlatFileEncoder::new(
            w,
            backend.flat_file.clone().unwrap_or_default(),
        ))),
        CodecKind::Parquet => Ok(Box::new(parquet::ParquetEncoder::new(
            w,
            backend.parquet.clone().unwrap_or_default(),
        )?)),
    }
}

/// Decode a complete buffer of a dataset's configured on-disk format back
/// into `(Context, Vec<Entity>)`. None of the five on-disk formats carry a
/// literal context object — the encoders only ever write rows — so every
/// format reports an empty context here (spec §4.7 read path).
pub fn decode(backend: &StorageBackend, bytes: Vec<u8>) -> Result<(Context, Vec<Entity>)> {
    use crate::config::CodecKind;
    match backend.codec_kind() {
        CodecKind::Json => json::decode(&bytes).map(|e| (Context::empty(), e)),
        CodecKind::Ndjson => ndjson::decode(&bytes, &backend.decode).map(|e| (Context::empty(), e)),
        CodecKind::Csv => csv::decode(&bytes, &backend.csv.clone().unwrap_or_default(), &backend.decode)
            .map(|e| (Context::empty(), e)),
        CodecKind::FlatFile => flatfile::decode(&bytes, &backend.flat_file.clone().unwrap_or_default(), &backend.decode)
            .map(|e| (Context::empty(), e)),
        CodecKind::Parquet => parquet::decode(bytes, &backend.decode).map(|e| (Context::empty(), e)),
    }
}

/// The decoded, re-serialized output of reading a dataset's objects back:
/// always a well-formed `[context, entity*, continuation?]` JSON array,
/// written incrementally to `out` (spec §3, Invariants).
pub fn write_json_array<W: std::io::Write>(
    out: &mut W,
    ctx: &Context,
    entities: impl IntoIterator<Item = Entity>,
    continuation_token: Option<&str>,
) -> Result<()> {
    use std::io::Write;
    write!(out, "[")?;
    serde_json::to_writer(&mut *out, ctx)?;
    for e in entities {
        write!(out, ",")?;
        serde_json::to_writer(&mut *out, &e)?;
    }
    if let Some(token) = continuation_token {
        write!(out, ",")?;
        serde_json::to_writer(&mut *out, &crate::entity::Continuation::new(token))?;
    }
    write!(out, "]")?;
    Ok(())
}
