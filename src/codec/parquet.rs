//! Columnar (Parquet) codec (spec §4.6). Grounded on
//! `original_source/internal/encoder/parquet.go`
//! (`ParquetEncoder.Write/Close/convertType`).

use crate::codec::Encoder;
use crate::config::ParquetConfig;
use crate::entity::{Context, Entity};
use crate::error::{DatalayerError, Result};
use crate::lowering::{decode_row, encode_entity};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int32Array, Int64Array,
    RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;

pub const DEFAULT_FLUSH_THRESHOLD: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalKind {
    PlainString,
    Binary,
    Int32,
    Date32,
    Int64,
    Int64Time,
    Float32,
    Float64,
    Boolean,
}

#[derive(Debug, Clone)]
pub struct SchemaColumn {
    pub name: String,
    pub kind: LogicalKind,
}

/// Parse the textual schema subset named in spec §4.6: one column per
/// non-blank line, `NAME PHYSICAL_TYPE [LOGICAL_TYPE]`.
pub fn parse_schema(text: &str) -> Result<Vec<SchemaColumn>> {
    let mut cols = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| DatalayerError::Config(format!("malformed schema line: {line:?}")))?
            .to_string();
        let physical = parts.next().unwrap_or("BYTE_ARRAY").to_uppercase();
        let logical = parts.next().map(|s| s.to_uppercase());

        let kind = match (physical.as_str(), logical.as_deref()) {
            ("BOOLEAN", _) => LogicalKind::Boolean,
            ("INT32", Some("DATE")) => LogicalKind::Date32,
            ("INT32", _) => LogicalKind::Int32,
            ("INT64", Some("TIME")) => LogicalKind::Int64Time,
            ("INT64", _) => LogicalKind::Int64,
            ("FLOAT", _) => LogicalKind::Float32,
            ("DOUBLE", _) => LogicalKind::Float64,
            ("BYTE_ARRAY", Some("STRING")) => LogicalKind::PlainString,
            ("BYTE_ARRAY", _) => LogicalKind::Binary,
            _ => {
                return Err(DatalayerError::Config(format!(
                    "unsupported schema column type: {line:?}"
                )))
            }
        };
        cols.push(SchemaColumn { name, kind });
    }
    Ok(cols)
}

pub fn arrow_field(col: &SchemaColumn) -> Field {
    let dt = match col.kind {
        LogicalKind::PlainString | LogicalKind::Binary => DataType::Utf8,
        LogicalKind::Int32 => DataType::Int32,
        LogicalKind::Date32 => DataType::Date32,
        LogicalKind::Int64 | LogicalKind::Int64Time => DataType::Int64,
        LogicalKind::Float32 => DataType::Float32,
        LogicalKind::Float64 => DataType::Float64,
        LogicalKind::Boolean => DataType::Boolean,
    };
    Field::new(&col.name, dt, true)
}

fn column_value(row: &serde_json::Map<String, Value>, col: &str) -> Option<Value> {
    row.get(col).cloned()
}

fn to_i32(v: Option<&Value>) -> Option<i32> {
    v.and_then(|v| v.as_i64()).map(|i| i as i32)
}

fn to_i64(v: Option<&Value>) -> Option<i64> {
    v.and_then(|v| v.as_i64())
}

fn to_f32(v: Option<&Value>) -> Option<f32> {
    v.and_then(|v| v.as_f64()).map(|f| f as f32)
}

fn to_f64(v: Option<&Value>) -> Option<f64> {
    v.and_then(|v| v.as_f64())
}

fn to_bool(v: Option<&Value>) -> Option<bool> {
    v.and_then(|v| v.as_bool())
}

fn to_string(v: Option<&Value>) -> Option<String> {
    v.map(|v| match v {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|i| match i {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    })
}

fn build_batch(schema: &Arc<Schema>, rows: &[serde_json::Map<String, Value>]) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields().iter() {
        let name = field.name();
        let arr: ArrayRef = match field.data_type() {
            DataType::Boolean => {
                Arc::new(BooleanArray::from(rows.iter().map(|r| to_bool(column_value(r, name).as_ref())).collect::<Vec<_>>()))
            }
            DataType::Int32 => {
                Arc::new(Int32Array::from(rows.iter().map(|r| to_i32(column_value(r, name).as_ref())).collect::<Vec<_>>()))
            }
            DataType::Date32 => {
                Arc::new(Date32Array::from(rows.iter().map(|r| to_i32(column_value(r, name).as_ref())).collect::<Vec<_>>()))
            }
            DataType::Int64 => {
                Arc::new(Int64Array::from(rows.iter().map(|r| to_i64(column_value(r, name).as_ref())).collect::<Vec<_>>()))
            }
            DataType::Float32 => {
                Arc::new(Float32Array::from(rows.iter().map(|r| to_f32(column_value(r, name).as_ref())).collect::<Vec<_>>()))
            }
            DataType::Float64 => {
                Arc::new(Float64Array::from(rows.iter().map(|r| to_f64(column_value(r, name).as_ref())).collect::<Vec<_>>()))
            }
            DataType::Utf8 => {
                Arc::new(StringArray::from(rows.iter().map(|r| to_string(column_value(r, name).as_ref())).collect::<Vec<_>>()))
            }
            other => return Err(DatalayerError::Codec(format!("unsupported arrow column type: {other:?}"))),
        };
        columns.push(arr);
    }
    RecordBatch::try_new(schema.clone(), columns).map_err(|e| DatalayerError::Codec(e.to_string()))
}

pub struct ParquetEncoder<W: Write + Send> {
    writer: Option<ArrowWriter<W>>,
    schema: Arc<Schema>,
    columns: Vec<SchemaColumn>,
    flush_threshold: u64,
    pending_rows: Vec<serde_json::Map<String, Value>>,
    pending_bytes: u64,
}

impl<W: Write + Send> ParquetEncoder<W> {
    pub fn new(writer: W, cfg: ParquetConfig) -> Result<Self> {
        let columns = parse_schema(&cfg.schema)?;
        let fields: Vec<Field> = columns.iter().map(arrow_field).collect();
        let schema = Arc::new(Schema::new(fields));
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let arrow_writer = ArrowWriter::try_new(writer, schema.clone(), Some(props))
            .map_err(|e| DatalayerError::Codec(e.to_string()))?;
        Ok(ParquetEncoder {
            writer: Some(arrow_writer),
            schema,
            columns,
            flush_threshold: cfg.flush_threshold.unwrap_or(DEFAULT_FLUSH_THRESHOLD),
            pending_rows: Vec::new(),
            pending_bytes: 0,
        })
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending_rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending_rows);
        self.pending_bytes = 0;
        let batch = build_batch(&self.schema, &rows)?;
        let writer = self.writer.as_mut().expect("encoder already finished");
        writer.write(&batch).map_err(|e| DatalayerError::Codec(e.to_string()))?;
        writer.flush().map_err(|e| DatalayerError::Codec(e.to_string()))?;
        Ok(())
    }
}

impl<W: Write + Send> Encoder for ParquetEncoder<W> {
    fn write_batch(&mut self, batch: &[Entity], ctx: &Context) -> Result<()> {
        for e in batch {
            let mut row = encode_entity(e, false, ctx);
            row.insert("id".to_string(), Value::String(e.id.clone()));
            row.insert("deleted".to_string(), Value::Bool(e.deleted));
            if let Some(r) = &e.recorded {
                row.insert("recorded".to_string(), Value::String(r.clone()));
            }
            self.pending_bytes += serde_json::to_vec(&row).map(|v| v.len() as u64).unwrap_or(0);
            self.pending_rows.push(row);
            if self.pending_bytes >= self.flush_threshold {
                self.flush_pending()?;
            }
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.flush_pending()?;
        let writer = self.writer.take().expect("encoder already finished");
        writer.close().map_err(|e| DatalayerError::Codec(e.to_string()))?;
        Ok(())
    }
}

/// Decode a complete Parquet file buffer. Columnar footers sit at the end,
/// so the whole file is materialized in memory before reading (spec §4.6).
pub fn decode(
    bytes: Vec<u8>,
    decode_cfg: &crate::config::DecodeConfig,
) -> Result<Vec<Entity>> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))
        .map_err(|e| DatalayerError::Codec(e.to_string()))?
        .build()
        .map_err(|e| DatalayerError::Codec(e.to_string()))?;

    let mut entities = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| DatalayerError::Codec(e.to_string()))?;
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut row = serde_json::Map::new();
            for (col_idx, field) in schema.fields().iter().enumerate() {
                let col = batch.column(col_idx);
                let value = arrow_cell_to_json(col.as_ref(), row_idx);
                row.insert(field.name().clone(), value);
            }
            if let Some(entity) = decode_row(&row, decode_cfg)? {
                entities.push(entity);
            }
        }
    }
    Ok(entities)
}

fn arrow_cell_to_json(col: &dyn arrow_array::Array, idx: usize) -> Value {
    use arrow_array::Array;
    if col.is_null(idx) {
        return Value::Null;
    }
    match col.data_type() {
        DataType::Boolean => Value::Bool(col.as_any().downcast_ref::<BooleanArray>().unwrap().value(idx)),
        DataType::Int32 => Value::Number(col.as_any().downcast_ref::<Int32Array>().unwrap().value(idx).into()),
        DataType::Date32 => Value::Number(col.as_any().downcast_ref::<Date32Array>().unwrap().value(idx).into()),
        DataType::Int64 => Value::Number(col.as_any().downcast_ref::<Int64Array>().unwrap().value(idx).into()),
        DataType::Float32 => serde_json::Number::from_f64(col.as_any().downcast_ref::<Float32Array>().unwrap().value(idx) as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        DataType::Float64 => serde_json::Number::from_f64(col.as_any().downcast_ref::<Float64Array>().unwrap().value(idx))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        DataType::Utf8 => Value::String(col.as_any().downcast_ref::<StringArray>().unwrap().value(idx).to_string()),
        _ => Value::Null,
    }
}
