//! Newline-delimited JSON codec (spec §4.3): one flat row per line, no
//! array brackets. Used by `athenaCompatible` datasets so each line is a
//! row Athena can query directly. Grounded on
//! `original_source/internal/encoder/ndjson.go`.

use crate::codec::Encoder;
use crate::config::DecodeConfig;
use crate::entity::{Context, Entity};
use crate::error::Result;
use crate::lowering::{decode_row, encode_entity};
use std::io::Write;

pub struct NdjsonEncoder<W: Write> {
    writer: W,
    resolve_namespace: bool,
}

impl<W: Write> NdjsonEncoder<W> {
    pub fn new(writer: W, resolve_namespace: bool) -> Self {
        NdjsonEncoder {
            writer,
            resolve_namespace,
        }
    }
}

impl<W: Write> Encoder for NdjsonEncoder<W> {
    fn write_batch(&mut self, batch: &[Entity], ctx: &Context) -> Result<()> {
        for e in batch {
            let row = encode_entity(e, self.resolve_namespace, ctx);
            serde_json::to_writer(&mut self.writer, &row)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Incremental counterpart of `decode` (spec §1): buffers only up to the
/// next `\n`, so a backend reader can be fed in fixed-size chunks without
/// holding the whole object in memory. `finish` flushes a final line that
/// never got a trailing newline.
pub struct NdjsonStreamDecoder {
    cfg: DecodeConfig,
    pending: Vec<u8>,
}

impl NdjsonStreamDecoder {
    pub fn new(cfg: DecodeConfig) -> Self {
        NdjsonStreamDecoder {
            cfg,
            pending: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Entity>> {
        self.pending.extend_from_slice(chunk);
        let mut entities = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.decode_line(&line[..line.len() - 1], &mut entities)?;
        }
        Ok(entities)
    }

    pub fn finish(mut self) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.decode_line(&line, &mut entities)?;
        }
        Ok(entities)
    }

    fn decode_line(&self, line: &[u8], out: &mut Vec<Entity>) -> Result<()> {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(());
        }
        let row: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(line)?;
        if let Some(entity) = decode_row(&row, &self.cfg)? {
            out.push(entity);
        }
        Ok(())
    }
}

/// Decode a complete NDJSON buffer, applying `cfg`'s lowering rules to
/// each line, dropping rows with no id (spec §4.2 step 4).
pub fn decode(bytes: &[u8], cfg: &DecodeConfig) -> Result<Vec<Entity>> {
    let mut decoder = NdjsonStreamDecoder::new(cfg.clone());
    let mut entities = decoder.feed(bytes)?;
    entities.extend(decoder.finish()?);
    Ok(entities)
}
