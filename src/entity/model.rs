//! The `Entity` / `Context` / continuation wire types (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single record flowing through the pipeline.
///
/// `props` and `refs` are `serde_json::Map` rather than a plain `HashMap` so
/// JSON round-trips keep arbitrary nested `Value`s (lists, numbers, nested
/// objects) without a lossy intermediate representation — the lowering and
/// codec layers are the only places that interpret their shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: String,

    #[serde(default, rename = "deleted")]
    pub deleted: bool,

    #[serde(default)]
    pub refs: Map<String, Value>,

    #[serde(default)]
    pub props: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded: Option<String>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: false,
            refs: Map::new(),
            props: Map::new(),
            recorded: None,
        }
    }

    /// Strip the namespace prefix off every property key, keeping only the
    /// local name. Used by `stripProps` datasets (§3, §4.3). Reference keys
    /// are left untouched — only properties are ever stripped.
    pub fn stripped_props(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (k, v) in &self.props {
            let local = k.splitn(2, ':').nth(1).unwrap_or(k.as_str());
            out.insert(local.to_string(), v.clone());
        }
        out
    }
}

/// The `@context` prelude entity (spec §3). Always the first array element
/// of a read response and, on ingest, recognized by `id == "@context"`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Context {
    pub id: String,
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
}

impl Context {
    pub const ID: &'static str = "@context";

    pub fn new(namespaces: BTreeMap<String, String>) -> Self {
        Self {
            id: Self::ID.to_string(),
            namespaces,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }
}

/// The trailing `@continuation` element of a `/changes` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Continuation {
    pub id: String,
    pub token: String,
}

impl Continuation {
    pub const ID: &'static str = "@continuation";

    pub fn new(token: impl Into<String>) -> Self {
        Self {
            id: Self::ID.to_string(),
            token: token.into(),
        }
    }
}
