//! Lowering-neutral post-encode ordering (spec §4.7).
//!
//! Applies to a delimited or fixed-width byte buffer: split by newline,
//! sort by the integer value of each configured `[start,end)` window,
//! reassemble. A window that fails to parse as an integer aborts the
//! encode with a hard error rather than being silently skipped (see
//! `DESIGN.md`).

use crate::config::{OrderType, OrderingConfig};
use crate::error::{DatalayerError, Result};

pub fn sort_buffer(buf: &[u8], cfg: &OrderingConfig) -> Result<Vec<u8>> {
    if cfg.order_by.is_empty() {
        return Ok(buf.to_vec());
    }

    let text = std::str::from_utf8(buf)
        .map_err(|e| DatalayerError::Codec(format!("ordering requires UTF-8 input: {e}")))?;
    let mut lines: Vec<&str> = text.split('\n').collect();
    let trailing_empty = lines.last().is_some_and(|l| l.is_empty());
    if trailing_empty {
        lines.pop();
    }

    let key_of = |line: &str| -> Result<Vec<i64>> {
        let chars: Vec<char> = line.chars().collect();
        cfg.order_by
            .iter()
            .map(|(start, end)| {
                let end = (*end).min(chars.len());
                let window: String = if *start < end {
                    chars[*start..end].iter().collect()
                } else {
                    String::new()
                };
                window.trim().parse::<i64>().map_err(|_| {
                    DatalayerError::Codec(format!(
                        "ordering window [{start},{end}) of {window:?} does not parse as an integer"
                    ))
                })
            })
            .collect()
    };

    let mut keyed: Vec<(Vec<i64>, &str)> = lines
        .into_iter()
        .map(|l| key_of(l).map(|k| (k, l)))
        .collect::<Result<Vec<_>>>()?;

    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    if cfg.order_type == OrderType::Desc {
        keyed.reverse();
    }

    let mut out = keyed.into_iter().map(|(_, l)| l).collect::<Vec<_>>().join("\n");
    if trailing_empty {
        out.push('\n');
    }
    Ok(out.into_bytes())
}
