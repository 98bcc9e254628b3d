//! Entity-JSON codec (spec §4.3): `[` + comma-separated entities + `]`.

use crate::codec::Encoder;
use crate::entity::{Context, Entity};
use crate::error::{DatalayerError, Result};
use std::io::Write;

pub struct JsonEncoder<W: Write> {
    writer: W,
    strip_props: bool,
    wrote_any: bool,
}

impl<W: Write> JsonEncoder<W> {
    pub fn new(mut writer: W, strip_props: bool) -> Self {
        let _ = writer.write_all(b"[");
        JsonEncoder {
            writer,
            strip_props,
            wrote_any: false,
        }
    }
}

impl<W: Write> Encoder for JsonEncoder<W> {
    fn write_batch(&mut self, batch: &[Entity], _ctx: &Context) -> Result<()> {
        for e in batch {
            if self.wrote_any {
                self.writer.write_all(b",")?;
            }
            self.wrote_any = true;
            if self.strip_props {
                serde_json::to_writer(&mut self.writer, &e.stripped_props())?;
            } else {
                serde_json::to_writer(&mut self.writer, e)?;
            }
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.write_all(b"]")?;
        Ok(())
    }
}

/// Incremental counterpart of `decode`, fed arbitrary byte chunks as they
/// arrive off a backend reader (spec §1: payloads larger than memory).
/// Reuses the same top-level-array boundary scanner as the ingest parser.
pub struct JsonStreamDecoder {
    scanner: crate::entity::parser::ArrayScanner,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        JsonStreamDecoder {
            scanner: Default::default(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Entity>> {
        let values = self.scanner.feed(chunk)?;
        let mut entities = Vec::with_capacity(values.len());
        for v in values {
            if v.get("id").and_then(|i| i.as_str()) == Some(crate::entity::Continuation::ID) {
                continue;
            }
            let entity: Entity = serde_json::from_value(v)
                .map_err(|e| DatalayerError::Malformed(format!("invalid entity: {e}")))?;
            entities.push(entity);
        }
        Ok(entities)
    }
}

impl Default for JsonStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a complete, already-buffered entity-JSON array as written by
/// `JsonEncoder`: `[entity, entity, …]`, no leading context element (the
/// encoder never writes one — §4.3). Callers that need the read-response
/// context wrap the result in an empty one, same as every other codec.
pub fn decode(bytes: &[u8]) -> Result<Vec<Entity>> {
    JsonStreamDecoder::new().feed(bytes)
}
