//! Fixed-width (FlatFile) codec (spec §4.5). Grounded on
//! `original_source/internal/encoder/flatFile.go`
//! (`FlatFileDecoder.Read/ParseLine/convertType`).

use crate::codec::Encoder;
use crate::config::{FlatFileConfig, FlatFileField};
use crate::entity::{Context, Entity};
use crate::error::{DatalayerError, Result};
use crate::lowering::decode_row;
use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use std::io::Write;

fn local_name(k: &str) -> &str {
    k.splitn(2, ':').nth(1).unwrap_or(k)
}

fn strip_if_string(v: &Value) -> Value {
    match v {
        Value::String(s) => Value::String(local_name(s).to_string()),
        other => other.clone(),
    }
}

fn find_value<'a>(entity: &'a Entity, name: &str) -> Option<Value> {
    for (k, v) in &entity.props {
        if local_name(k) == name {
            return Some(v.clone());
        }
    }
    for (k, v) in &entity.refs {
        if local_name(k) == name {
            return Some(strip_if_string(v));
        }
    }
    None
}

fn pad_runes_right(s: &str, width: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() >= width {
        chars[..width].iter().collect()
    } else {
        let mut out = s.to_string();
        out.push_str(&" ".repeat(width - chars.len()));
        out
    }
}

fn format_field(field: &FlatFileField, value: Option<&Value>) -> String {
    let width = field.width();
    let s = match value {
        None => String::new(),
        Some(v) => match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        },
    };

    match field.r#type.as_str() {
        "integer" => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '-').collect();
            let padded = format!("{digits:0>width$}", width = width);
            if padded.len() > width {
                padded[padded.len() - width..].to_string()
            } else {
                padded
            }
        }
        "float" => {
            let f: f64 = s.parse().unwrap_or(0.0);
            let formatted = format!("{f:.*}", field.decimals);
            let no_point: String = formatted.chars().filter(|c| *c != '.').collect();
            if no_point.len() > width {
                no_point[..width].to_string()
            } else {
                format!("{no_point:<width$}", width = width)
            }
        }
        "date" => {
            let layout = field.date_layout.as_deref().unwrap_or("%Y-%m-%d");
            let formatted = chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.format(layout).to_string())
                .unwrap_or_else(|_| s.clone());
            pad_runes_right(&formatted, width)
        }
        _ => pad_runes_right(&s, width),
    }
}

pub struct FlatFileEncoder<W: Write> {
    writer: W,
    cfg: FlatFileConfig,
}

impl<W: Write> FlatFileEncoder<W> {
    pub fn new(writer: W, cfg: FlatFileConfig) -> Self {
        FlatFileEncoder { writer, cfg }
    }

    fn field_by_name(&self, name: &str) -> Option<&FlatFileField> {
        self.cfg.fields.iter().find(|f| f.name == name)
    }
}

impl<W: Write> Encoder for FlatFileEncoder<W> {
    fn write_batch(&mut self, batch: &[Entity], _ctx: &Context) -> Result<()> {
        for e in batch {
            let mut cells = Vec::with_capacity(self.cfg.field_order.len());
            let mut any_present = false;
            for name in &self.cfg.field_order {
                let Some(field) = self.field_by_name(name) else {
                    continue;
                };
                let value = find_value(e, name);
                if value.is_some() {
                    any_present = true;
                }
                cells.push(format_field(field, value.as_ref()));
            }
            if !any_present {
                continue;
            }
            self.writer.write_all(cells.concat().as_bytes())?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn parse_line_field(line: &str, field: &FlatFileField) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::new();
    for (start, end) in &field.ranges {
        let end = (*end).min(chars.len());
        if *start < end {
            out.extend(&chars[*start..end]);
        }
    }
    out
}

fn convert_type(raw: &str, field: &FlatFileField, timezone: Tz) -> Result<Value> {
    let trimmed = raw.trim();
    match field.r#type.as_str() {
        "integer" => trimmed
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .map_err(|_| DatalayerError::Codec(format!("cannot parse {trimmed:?} as integer"))),
        "float" => {
            let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit() || *c == '-').collect();
            if digits.is_empty() {
                return Err(DatalayerError::Codec(format!("cannot parse {trimmed:?} as float")));
            }
            let (sign, digits) = if let Some(d) = digits.strip_prefix('-') {
                ("-", d)
            } else {
                ("", digits.as_str())
            };
            let dec = field.decimals.min(digits.len());
            let split_at = digits.len() - dec;
            let (int_part, frac_part) = digits.split_at(split_at);
            let combined = if frac_part.is_empty() {
                format!("{sign}{int_part}")
            } else {
                format!("{sign}{int_part}.{frac_part}")
            };
            combined
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| DatalayerError::Codec(format!("cannot parse {trimmed:?} as float")))
        }
        "date" => {
            let layout = field.date_layout.as_deref().unwrap_or("%Y-%m-%d");
            let date = NaiveDate::parse_from_str(trimmed, layout)
                .map_err(|e| DatalayerError::Codec(format!("cannot parse date {trimmed:?}: {e}")))?;
            let dt = date.and_hms_opt(0, 0, 0).unwrap();
            let zoned = timezone
                .from_local_datetime(&dt)
                .single()
                .ok_or_else(|| DatalayerError::Codec(format!("ambiguous local time for {trimmed:?}")))?;
            Ok(Value::String(zoned.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)))
        }
        _ => Ok(Value::String(trimmed.to_string())),
    }
}

fn decode_one_line(
    line: &str,
    cfg: &FlatFileConfig,
    decode_cfg: &crate::config::DecodeConfig,
    timezone: Tz,
) -> Result<Option<Entity>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let mut row: Map<String, Value> = Map::new();
    let mut line_failed = None;
    for field in &cfg.fields {
        let raw = parse_line_field(line, field);
        match convert_type(&raw, field, timezone) {
            Ok(v) => {
                row.insert(field.name.clone(), v);
            }
            Err(e) => {
                line_failed = Some(e);
                break;
            }
        }
    }
    if let Some(err) = line_failed {
        if cfg.continue_on_parse_error {
            tracing::warn!(error = %err, line, "skipping unparsable fixed-width line");
            return Ok(None);
        }
        return Err(err);
    }
    decode_row(&row, decode_cfg)
}

/// Incremental counterpart of `decode` (spec §1): buffers only up to the
/// next `\n`. `finish` flushes a final line with no trailing newline.
pub struct FlatFileStreamDecoder {
    cfg: FlatFileConfig,
    decode_cfg: crate::config::DecodeConfig,
    timezone: Tz,
    pending: Vec<u8>,
}

impl FlatFileStreamDecoder {
    pub fn new(cfg: FlatFileConfig, decode_cfg: crate::config::DecodeConfig) -> Self {
        let timezone: Tz = cfg
            .timezone
            .as_deref()
            .unwrap_or("UTC")
            .parse()
            .unwrap_or(chrono_tz::UTC);
        FlatFileStreamDecoder {
            cfg,
            decode_cfg,
            timezone,
            pending: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Entity>> {
        self.pending.extend_from_slice(chunk);
        let mut entities = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let mut body = &raw[..raw.len() - 1];
            if body.last() == Some(&b'\r') {
                body = &body[..body.len() - 1];
            }
            let line = String::from_utf8_lossy(body).into_owned();
            if let Some(entity) = decode_one_line(&line, &self.cfg, &self.decode_cfg, self.timezone)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    pub fn finish(mut self) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(entity) = decode_one_line(&line, &self.cfg, &self.decode_cfg, self.timezone)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }
}

/// Decode a complete fixed-width buffer into entities.
pub fn decode(
    bytes: &[u8],
    cfg: &FlatFileConfig,
    decode_cfg: &crate::config::DecodeConfig,
) -> Result<Vec<Entity>> {
    let mut decoder = FlatFileStreamDecoder::new(cfg.clone(), decode_cfg.clone());
    let mut entities = decoder.feed(bytes)?;
    entities.extend(decoder.finish()?);
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, ranges: &[(usize, usize)], ty: &str, decimals: usize) -> FlatFileField {
        FlatFileField {
            name: name.to_string(),
            ranges: ranges.to_vec(),
            r#type: ty.to_string(),
            decimals,
            date_layout: None,
        }
    }

    #[test]
    fn every_row_has_width_equal_to_sum_of_field_widths() {
        let cfg = FlatFileConfig {
            fields: vec![field("id", &[(0, 5)], "string", 0), field("age", &[(0, 3)], "integer", 0)],
            field_order: vec!["id".to_string(), "age".to_string()],
            continue_on_parse_error: false,
            timezone: None,
        };
        let mut e = Entity::new("a:1");
        e.props.insert("a:age".into(), json!("7"));
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut enc = Box::new(FlatFileEncoder::new(&mut buf, cfg));
            enc.write_batch(&[e], &Context::empty()).unwrap();
            enc.finish().unwrap();
        }
        let line = String::from_utf8(buf).unwrap();
        let line = line.trim_end_matches('\n');
        assert_eq!(line.len(), 8);
        assert_eq!(line, "a:1  007");
    }

    #[test]
    fn omits_row_when_every_field_absent() {
        let cfg = FlatFileConfig {
            fields: vec![field("missing", &[(0, 3)], "string", 0)],
            field_order: vec!["missing".to_string()],
            continue_on_parse_error: false,
            timezone: None,
        };
        let e = Entity::new("a:1");
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut enc = Box::new(FlatFileEncoder::new(&mut buf, cfg));
            enc.write_batch(&[e], &Context::empty()).unwrap();
            enc.finish().unwrap();
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_parses_integer_fields() {
        let cfg = FlatFileConfig {
            fields: vec![field("id", &[(0, 5)], "string", 0), field("age", &[(5, 8)], "integer", 0)],
            field_order: vec!["id".to_string(), "age".to_string()],
            continue_on_parse_error: false,
            timezone: None,
        };
        let decode_cfg = crate::config::DecodeConfig {
            id_property: Some("id".to_string()),
            ..Default::default()
        };
        let entities = decode(b"a:1  007\n", &cfg, &decode_cfg).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].props.get(":age"), Some(&json!(7)));
    }

    #[test]
    fn continue_on_parse_error_skips_bad_lines() {
        let cfg = FlatFileConfig {
            fields: vec![field("id", &[(0, 5)], "string", 0), field("age", &[(5, 8)], "integer", 0)],
            field_order: vec!["id".to_string(), "age".to_string()],
            continue_on_parse_error: true,
            timezone: None,
        };
        let decode_cfg = crate::config::DecodeConfig {
            id_property: Some("id".to_string()),
            ..Default::default()
        };
        let entities = decode(b"a:1  xxx\na:2  042\n", &cfg, &decode_cfg).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, "a:2");
    }
}
