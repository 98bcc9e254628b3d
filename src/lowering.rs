//! Entity ↔ flat-map lowering (spec §4.2).
//!
//! Every textual and columnar codec shares this layer: decoders hand it a
//! flat `row` (column name → string/typed value) and get an `Entity` back;
//! encoders hand it an `Entity` and get a flat row suitable for column
//! projection. Grounded on `original_source/internal/encoder/decoder.go`
//! (`toEntityBytes`, `withPrefix`, `extractID`, `prefixValues`) and
//! `encoder.go` (`propStripper`).

use crate::config::DecodeConfig;
use crate::entity::{Context, Entity};
use crate::error::{DatalayerError, Result};
use serde_json::{Map, Value};

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn coerce_scalar(col_type: Option<&crate::config::ColumnType>, v: Value) -> Result<Value> {
    use crate::config::ColumnType;
    let Some(t) = col_type else { return Ok(v) };
    let s = value_as_string(&v);
    match t {
        ColumnType::Int => s
            .trim()
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .map_err(|_| DatalayerError::Codec(format!("cannot parse {s:?} as int"))),
        ColumnType::Float => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| DatalayerError::Codec(format!("cannot parse {s:?} as float"))),
        ColumnType::Bool => s
            .trim()
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|_| DatalayerError::Codec(format!("cannot parse {s:?} as bool"))),
    }
}

fn wrap_with_value_prefix(value_prefix: &str, v: Value) -> Value {
    match v {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|i| wrap_with_value_prefix(value_prefix, i))
                .collect(),
        ),
        other => Value::String(format!("{value_prefix}:{}", value_as_string(&other))),
    }
}

/// Decode one flat row into an `Entity`, per the strict order in spec §4.2:
/// defaults → concat → ignore → id extraction → per-column mapping/typing/
/// prefixing. Returns `Ok(None)` when the id column is missing or empty
/// (dropped, not an error).
pub fn decode_row(row: &Map<String, Value>, cfg: &DecodeConfig) -> Result<Option<Entity>> {
    let mut row = row.clone();

    // 1. Overlay defaults.
    for (k, v) in &cfg.defaults {
        row.insert(k.clone(), Value::String(v.clone()));
    }

    // 2. concatColumns: row[k] = joined comma string of present source columns.
    for (dest, sources) in &cfg.concat_columns {
        let joined = sources
            .iter()
            .filter_map(|s| row.get(s))
            .map(value_as_string)
            .collect::<Vec<_>>()
            .join(",");
        row.insert(dest.clone(), Value::String(joined));
    }

    // 3. Drop ignored columns.
    for k in &cfg.ignore_columns {
        row.remove(k);
    }

    // 4. Extract id.
    let id_col = cfg.id_property.as_deref().unwrap_or("id");
    let raw_id = row.remove(id_col);
    let raw_id_str = raw_id.as_ref().map(value_as_string).unwrap_or_default();
    if raw_id_str.is_empty() {
        return Ok(None);
    }
    let id = match cfg.property_prefixes.get(id_col).and_then(|p| p.value_prefix.as_deref()) {
        Some(vp) => format!("{vp}:{raw_id_str}"),
        None => raw_id_str,
    };

    let mut props = Map::new();
    let mut refs = Map::new();

    // 5. Every remaining column.
    for (k, v) in row {
        // 5a. Rename.
        let renamed = cfg.column_mappings.get(&k).cloned().unwrap_or_else(|| k.clone());

        // 5b. Split list-value columns.
        let mut value = if let Some(sep) = cfg.list_value_columns.get(&k) {
            let s = value_as_string(&v);
            Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.trim().to_string()))
                    .collect(),
            )
        } else {
            v
        };

        // 5c. Coerce type (scalar or each list element).
        let col_type = cfg.column_types.get(&k);
        value = match value {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|i| coerce_scalar(col_type, i))
                    .collect::<Result<Vec<_>>>()?,
            ),
            other => coerce_scalar(col_type, other)?,
        };

        // 5d. Destination bucket.
        let is_ref = cfg.refs.iter().any(|r| r == &renamed);

        // 5e. Namespace prefix.
        let (final_key, final_value) = match cfg.property_prefixes.get(&k) {
            Some(p) => {
                let key = format!("{}:{renamed}", p.key_prefix);
                match &p.value_prefix {
                    Some(vp) => (key, wrap_with_value_prefix(vp, value)),
                    None => (key, value),
                }
            }
            None => {
                let ns = cfg.default_namespace.as_deref().unwrap_or("");
                (format!("{ns}:{renamed}"), value)
            }
        };

        if is_ref {
            refs.insert(final_key, final_value);
        } else {
            props.insert(final_key, final_value);
        }
    }

    Ok(Some(Entity {
        id,
        deleted: false,
        refs,
        props,
        recorded: None,
    }))
}

/// Encode direction: reverse the prefixing, yielding a flat row of local
/// column names suitable for delimited/fixed-width/columnar projection.
/// When `resolve_namespace` is set, `short:local` values are expanded to
/// `<namespaceURI><local>` using `ctx`.
pub fn encode_entity(entity: &Entity, resolve_namespace: bool, ctx: &Context) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("id".to_string(), Value::String(entity.id.clone()));
    if let Some(r) = &entity.recorded {
        row.insert("recorded".to_string(), Value::String(r.clone()));
    }

    for (k, v) in entity.props.iter().chain(entity.refs.iter()) {
        let local = k.splitn(2, ':').nth(1).unwrap_or(k.as_str());
        let value = if resolve_namespace {
            resolve_value(v, ctx)
        } else {
            v.clone()
        };
        row.insert(local.to_string(), value);
    }

    row
}

fn resolve_value(v: &Value, ctx: &Context) -> Value {
    match v {
        Value::String(s) => Value::String(resolve_str(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|i| resolve_value(i, ctx)).collect()),
        other => other.clone(),
    }
}

fn resolve_str(s: &str, ctx: &Context) -> String {
    if let Some((short, local)) = s.split_once(':') {
        if let Some(uri) = ctx.namespaces.get(short) {
            return format!("{uri}{local}");
        }
    }
    s.to_string()
}
