//! Delimited-text (CSV) codec (spec §4.4), RFC 4180 quoting via the `csv`
//! crate. Grounded on `original_source/internal/encoder/csv.go`.

use crate::codec::Encoder;
use crate::config::{CsvConfig, DecodeConfig};
use crate::entity::{Context, Entity};
use crate::error::{DatalayerError, Result};
use crate::lowering::{decode_row, encode_entity};
use serde_json::Value;
use std::io::Write;

fn cell_value(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        // §9 open question (i): decimals are ignored, always 0 fractional
        // digits — replicated exactly even though it looks unintentional.
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{f:.0}"),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| cell_value(Some(i)))
            .collect::<Vec<_>>()
            .join(","),
        Some(other) => other.to_string(),
    }
}

pub struct CsvEncoder<W: Write> {
    writer: csv::Writer<W>,
    order: Vec<String>,
    header_written: bool,
    write_header: bool,
}

impl<W: Write> CsvEncoder<W> {
    pub fn new(writer: W, cfg: CsvConfig) -> Self {
        let csv_writer = csv::WriterBuilder::new()
            .delimiter(cfg.separator as u8)
            .from_writer(writer);
        CsvEncoder {
            writer: csv_writer,
            order: cfg.order,
            header_written: false,
            write_header: cfg.header,
        }
    }
}

impl<W: Write> Encoder for CsvEncoder<W> {
    fn write_batch(&mut self, batch: &[Entity], ctx: &Context) -> Result<()> {
        if self.write_header && !self.header_written {
            self.writer
                .write_record(&self.order)
                .map_err(|e| DatalayerError::Codec(e.to_string()))?;
            self.header_written = true;
        }
        for e in batch {
            let row = encode_entity(e, false, ctx);
            let record: Vec<String> = self.order.iter().map(|col| cell_value(row.get(col))).collect();
            self.writer
                .write_record(&record)
                .map_err(|e| DatalayerError::Codec(e.to_string()))?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| DatalayerError::Codec(e.to_string()))
    }
}

/// Decode CSV off any `std::io::Read`, invoking `on_entity` as each row is
/// lowered instead of collecting a `Vec` — the primitive the streaming read
/// path (spec §1) runs inside `spawn_blocking` over a bridged async reader,
/// since the `csv` crate has no async reader support of its own. Skips
/// `skipRows` raw lines, determines a header (from config `order` or the
/// file's own header row), zips every subsequent row against it, applies
/// §4.2 lowering. Rows shorter than the header are skipped.
pub fn decode_with<R: std::io::Read>(
    reader: R,
    csv_cfg: &CsvConfig,
    decode_cfg: &DecodeConfig,
    mut on_entity: impl FnMut(Entity) -> Result<()>,
) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(csv_cfg.separator as u8)
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut records = reader.records();
    for _ in 0..csv_cfg.skip_rows {
        records.next();
    }

    let header: Vec<String> = if !csv_cfg.order.is_empty() {
        csv_cfg.order.clone()
    } else {
        match records.next() {
            Some(r) => r
                .map_err(|e| DatalayerError::Codec(e.to_string()))?
                .iter()
                .map(|s| s.to_string())
                .collect(),
            None => return Ok(()),
        }
    };

    for rec in records {
        let rec = rec.map_err(|e| DatalayerError::Codec(e.to_string()))?;
        if rec.len() < header.len() {
            continue;
        }
        let row: serde_json::Map<String, Value> = header
            .iter()
            .cloned()
            .zip(rec.iter().map(|s| Value::String(s.to_string())))
            .collect();
        if let Some(entity) = decode_row(&row, decode_cfg)? {
            on_entity(entity)?;
        }
    }
    Ok(())
}

/// Decode a complete, already-buffered CSV object.
pub fn decode(bytes: &[u8], csv_cfg: &CsvConfig, decode_cfg: &DecodeConfig) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();
    decode_with(bytes, csv_cfg, decode_cfg, |e| {
        entities.push(e);
        Ok(())
    })?;
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_header_then_rows_in_order() {
        let cfg = CsvConfig {
            header: true,
            separator: ',',
            order: vec!["id".to_string(), "name".to_string()],
            ..Default::default()
        };
        let mut e = Entity::new("a:1");
        e.props.insert("a:name".into(), json!("Frank"));
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut enc = Box::new(CsvEncoder::new(&mut buf, cfg));
            enc.write_batch(&[e], &Context::empty()).unwrap();
            enc.finish().unwrap();
        }
        let s = String::from_utf8(buf).unwrap();
        let mut lines = s.lines();
        assert_eq!(lines.next().unwrap(), "id,name");
        assert_eq!(lines.next().unwrap(), "a:1,Frank");
    }

    #[test]
    fn absent_column_is_empty_cell() {
        let cfg = CsvConfig {
            header: false,
            separator: ',',
            order: vec!["id".to_string(), "missing".to_string()],
            ..Default::default()
        };
        let e = Entity::new("a:1");
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut enc = Box::new(CsvEncoder::new(&mut buf, cfg));
            enc.write_batch(&[e], &Context::empty()).unwrap();
            enc.finish().unwrap();
        }
        let s = String::from_utf8(buf).unwrap();
        assert_eq!(s.trim_end(), "a:1,");
    }

    #[test]
    fn decode_zips_header_into_rows_and_lowers() {
        let input = b"id,name\n1,Frank\n2,Bob\n";
        let csv_cfg = CsvConfig {
            header: false,
            separator: ',',
            order: Vec::new(),
            ..Default::default()
        };
        let mut decode_cfg = DecodeConfig::default();
        decode_cfg.default_namespace = Some("ns".to_string());
        let entities = decode(input, &csv_cfg, &decode_cfg).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].props.get("ns:name"), Some(&json!("Frank")));
    }

    #[test]
    fn decode_skips_short_rows() {
        let input = b"id,name\n1,Frank\n2\n";
        let csv_cfg = CsvConfig {
            header: false,
            separator: ',',
            order: Vec::new(),
            ..Default::default()
        };
        let decode_cfg = DecodeConfig::default();
        let entities = decode(input, &csv_cfg, &decode_cfg).unwrap();
        assert_eq!(entities.len(), 1);
    }
}
