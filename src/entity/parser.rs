//! Incremental entity-stream parser (spec §4.1).
//!
//! The request body is a JSON array `[context, entity*, ...]`. We never
//! buffer the whole payload: a small scanner finds the byte range of each
//! top-level array element (tracking string/escape state and brace depth)
//! as bytes arrive, decodes just that slice with `serde_json`, and folds it
//! into the current batch. Memory is bounded by `batch_size`, not payload
//! size, mirroring the original `jstream`-based decoder
//! (`original_source/internal/entity/parser.go`) without pulling in a
//! separate streaming-JSON crate — `serde_json` already does the per-value
//! decode once we've found the slice boundaries ourselves.

use crate::entity::model::{Context, Entity};
use crate::error::{DatalayerError, Result};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Scans a byte stream for top-level JSON-array element boundaries.
///
/// All elements in this protocol are JSON objects, so the scanner only
/// needs to track `{`/`}` nesting depth and string/escape state — it
/// never has to special-case bare scalars at the top level.
#[derive(Default)]
pub(crate) struct ArrayScanner {
    buf: Vec<u8>,
    seen_open: bool,
    finished: bool,
    in_string: bool,
    escape: bool,
    depth: u32,
    value_start: Option<usize>,
}

impl ArrayScanner {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Value>> {
        self.buf.extend_from_slice(chunk);
        let mut values = Vec::new();
        let mut i = 0usize;

        if !self.seen_open {
            while i < self.buf.len() && (self.buf[i] as char).is_ascii_whitespace() {
                i += 1;
            }
            if i >= self.buf.len() {
                self.buf.drain(..i);
                return Ok(values);
            }
            if self.buf[i] != b'[' {
                return Err(DatalayerError::Malformed(
                    "expected a JSON array".to_string(),
                ));
            }
            i += 1;
            self.seen_open = true;
        }

        while i < self.buf.len() {
            if self.finished {
                break;
            }
            let b = self.buf[i];

            if let Some(start) = self.value_start {
                if self.in_string {
                    if self.escape {
                        self.escape = false;
                    } else if b == b'\\' {
                        self.escape = true;
                    } else if b == b'"' {
                        self.in_string = false;
                    }
                } else {
                    match b {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                let slice = &self.buf[start..=i];
                                let v: Value = serde_json::from_slice(slice).map_err(|e| {
                                    DatalayerError::Malformed(format!("invalid JSON element: {e}"))
                                })?;
                                values.push(v);
                                self.value_start = None;
                            }
                        }
                        _ => {}
                    }
                }
                i += 1;
                continue;
            }

            // Not inside a value: skip separators, detect end-of-array.
            if (b as char).is_ascii_whitespace() || b == b',' {
                i += 1;
                continue;
            }
            if b == b']' {
                self.finished = true;
                i += 1;
                continue;
            }
            if b == b'{' {
                self.value_start = Some(i);
                self.depth = 1;
                i += 1;
                continue;
            }
            return Err(DatalayerError::Malformed(format!(
                "unexpected byte {:?} at top level of entity array",
                b as char
            )));
        }

        self.buf.drain(..i);
        Ok(values)
    }
}

fn raw_to_entity(v: Value, store_deleted: bool) -> Result<Option<Entity>> {
    let obj = v
        .as_object()
        .ok_or_else(|| DatalayerError::Malformed("entity must be a JSON object".to_string()))?;

    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or(DatalayerError::MissingId)?
        .to_string();

    if id == crate::entity::Continuation::ID {
        return Ok(None);
    }

    let deleted = obj.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false);
    if deleted && !store_deleted {
        return Ok(None);
    }

    let recorded = obj.get("recorded").and_then(|v| match v {
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| n.as_f64().map(|f| (f as i64).to_string())),
        Value::String(s) => Some(s.clone()),
        _ => None,
    });

    let refs = obj
        .get("refs")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let props = obj
        .get("props")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    Ok(Some(Entity {
        id,
        deleted,
        refs,
        props,
        recorded,
    }))
}

fn value_to_context(v: &Value) -> Context {
    let namespaces = v
        .get("namespaces")
        .and_then(|n| n.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Context::new(namespaces)
}

/// Parse `reader` as a JSON-array entity stream, invoking `on_batch` once
/// per `batch_size` entities (and once more for a trailing partial batch).
/// A trailing `@continuation` element, if present, is dropped rather than
/// passed through as an entity (spec §4.1).
///
/// `on_batch` receives the batch together with the stream's `Context`
/// (empty if the stream had none) and returns a `Result` — any error it
/// returns aborts the parse immediately (`Downstream`, spec §4.1).
pub async fn parse_stream<R, F, Fut>(
    mut reader: R,
    batch_size: usize,
    store_deleted: bool,
    mut on_batch: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Vec<Entity>, Context) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let batch_size = if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    };

    let mut scanner = ArrayScanner::default();
    let mut context = Context::empty();
    let mut have_context = false;
    let mut batch = Vec::with_capacity(batch_size);
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        let values = if n == 0 {
            break;
        } else {
            scanner.feed(&chunk[..n])?
        };

        for v in values {
            if !have_context {
                context = value_to_context(&v);
                have_context = true;
                continue;
            }
            if let Some(entity) = raw_to_entity(v, store_deleted)? {
                batch.push(entity);
                if batch.len() >= batch_size {
                    let taken = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    on_batch(taken, context.clone()).await?;
                }
            }
        }
    }

    if !batch.is_empty() {
        on_batch(batch, context).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(s: &str) -> Cursor<Vec<u8>> {
        Cursor::new(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn parses_context_and_entities() {
        let input = r#"[
            {"id":"@context","namespaces":{"a":"http://example.com/a/"}},
            {"id":"a:1","props":{"a:name":"Frank"}},
            {"id":"a:2","props":{"a:name":"Bob"}}
        ]"#;
        let mut batches = Vec::new();
        parse_stream(reader(input), 10, false, |batch, ctx| {
            batches.push((batch, ctx));
            async { Ok(()) }
        })
        .await
        .unwrap();

        assert_eq!(batches.len(), 1);
        let (batch, ctx) = &batches[0];
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "a:1");
        assert_eq!(ctx.namespaces.get("a").unwrap(), "http://example.com/a/");
    }

    #[tokio::test]
    async fn respects_batch_size() {
        let input = r#"[{"id":"@context","namespaces":{}},{"id":"a:1"},{"id":"a:2"},{"id":"a:3"}]"#;
        let mut batch_lens = Vec::new();
        parse_stream(reader(input), 2, false, |batch, _| {
            batch_lens.push(batch.len());
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(batch_lens, vec![2, 1]);
    }

    #[tokio::test]
    async fn drops_deleted_when_not_stored() {
        let input = r#"[{"id":"@context","namespaces":{}},{"id":"a:1","deleted":true},{"id":"a:2"}]"#;
        let mut seen = Vec::new();
        parse_stream(reader(input), 10, false, |batch, _| {
            seen.extend(batch);
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, "a:2");
    }

    #[tokio::test]
    async fn keeps_deleted_when_store_deleted() {
        let input = r#"[{"id":"@context","namespaces":{}},{"id":"a:1","deleted":true}]"#;
        let mut seen = Vec::new();
        parse_stream(reader(input), 10, true, |batch, _| {
            seen.extend(batch);
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].deleted);
    }

    #[tokio::test]
    async fn missing_id_fails_whole_stream() {
        let input = r#"[{"id":"@context","namespaces":{}},{"props":{}}]"#;
        let result = parse_stream(reader(input), 10, false, |_, _| async { Ok(()) }).await;
        assert!(matches!(result, Err(DatalayerError::MissingId)));
    }

    #[tokio::test]
    async fn drops_trailing_continuation() {
        let input = r#"[{"id":"@context","namespaces":{}},{"id":"a:1"},{"id":"@continuation","token":"123"}]"#;
        let mut seen = Vec::new();
        parse_stream(reader(input), 10, false, |batch, _| {
            seen.extend(batch);
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, "a:1");
    }

    #[tokio::test]
    async fn recorded_numeric_becomes_canonical_string() {
        let input = r#"[{"id":"@context","namespaces":{}},{"id":"a:1","recorded":1699999999000}]"#;
        let mut seen = Vec::new();
        parse_stream(reader(input), 10, false, |batch, _| {
            seen.extend(batch);
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(seen[0].recorded.as_deref(), Some("1699999999000"));
    }

    #[tokio::test]
    async fn downstream_error_aborts_parse() {
        let input = r#"[{"id":"@context","namespaces":{}},{"id":"a:1"},{"id":"a:2"}]"#;
        let mut calls = 0;
        let result = parse_stream(reader(input), 1, false, |_, _| {
            calls += 1;
            async move {
                if calls == 1 {
                    Err(DatalayerError::Downstream("boom".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
