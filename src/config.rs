//! Dataset configuration schema and the live-reloading configuration
//! manager.
//!
//! The schema mirrors the field layout of the original configuration
//! format (same JSON tags, reinterpreted as serde field names) so a
//! config document written for that system loads unchanged here. The
//! reload machinery — atomic snapshot via `arc_swap`, digest gating,
//! env interpolation — is detailed in `DESIGN.md`.

use crate::error::{DatalayerError, Result};
use arc_swap::ArcSwap;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Storage backend kind for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    S3,
    Azure,
    Localstorage,
    Console,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthType {
    Sas,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStructure {
    Dated,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Asc,
    Desc,
}

impl Default for OrderType {
    fn default() -> Self {
        OrderType::Asc
    }
}

/// Backend-specific properties. All fields are optional because their
/// relevance depends on `storageType`; unused ones are simply absent in a
/// given dataset's document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageProps {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    #[serde(rename = "authType")]
    pub auth_type: Option<AuthType>,
    pub key: Option<String>,
    pub secret: Option<String>,
    #[serde(rename = "resourceName")]
    pub resource_name: Option<String>,
    #[serde(rename = "customResourcePath")]
    pub custom_resource_path: Option<bool>,
    #[serde(rename = "rootFolder")]
    pub root_folder: Option<String>,
    #[serde(rename = "folderStructure")]
    pub folder_structure: Option<FolderStructure>,
    #[serde(rename = "filePrefix")]
    pub file_prefix: Option<String>,
}

/// A `propertyPrefixes` entry: `keyPrefix[:valuePrefix]` split apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPrefix {
    pub key_prefix: String,
    pub value_prefix: Option<String>,
}

impl PropertyPrefix {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((k, v)) => PropertyPrefix {
                key_prefix: k.to_string(),
                value_prefix: Some(v.to_string()),
            },
            None => PropertyPrefix {
                key_prefix: raw.to_string(),
                value_prefix: None,
            },
        }
    }
}

impl Serialize for PropertyPrefix {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.value_prefix {
            Some(v) => s.serialize_str(&format!("{}:{}", self.key_prefix, v)),
            None => s.serialize_str(&self.key_prefix),
        }
    }
}

impl<'de> Deserialize<'de> for PropertyPrefix {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(PropertyPrefix::parse(&raw))
    }
}

/// Lowering rules shared by every textual/columnar decoder (spec §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeConfig {
    #[serde(default)]
    pub namespaces: HashMap<String, String>,
    #[serde(default, rename = "propertyPrefixes")]
    pub property_prefixes: HashMap<String, PropertyPrefix>,
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(rename = "idProperty")]
    pub id_property: Option<String>,
    #[serde(rename = "defaultNamespace")]
    pub default_namespace: Option<String>,
    #[serde(default, rename = "columnMappings")]
    pub column_mappings: HashMap<String, String>,
    #[serde(default, rename = "columnTypes")]
    pub column_types: HashMap<String, ColumnType>,
    #[serde(default, rename = "listValueColumns")]
    pub list_value_columns: HashMap<String, String>,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    #[serde(default, rename = "concatColumns")]
    pub concat_columns: HashMap<String, Vec<String>>,
    #[serde(default, rename = "ignoreColumns")]
    pub ignore_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsvConfig {
    #[serde(default)]
    pub header: bool,
    #[serde(default = "default_separator")]
    pub separator: char,
    pub encoding: Option<String>,
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default, rename = "skipRows")]
    pub skip_rows: usize,
    #[serde(default, rename = "validateFields")]
    pub validate_fields: bool,
}

fn default_separator() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatFileField {
    pub name: String,
    /// `[start, end)` substring ranges summed to give the field's width.
    pub ranges: Vec<(usize, usize)>,
    #[serde(default = "default_field_type")]
    pub r#type: String,
    #[serde(default)]
    pub decimals: usize,
    #[serde(rename = "dateLayout")]
    pub date_layout: Option<String>,
}

fn default_field_type() -> String {
    "string".to_string()
}

impl FlatFileField {
    pub fn width(&self) -> usize {
        self.ranges.iter().map(|(s, e)| e.saturating_sub(*s)).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlatFileConfig {
    #[serde(default)]
    pub fields: Vec<FlatFileField>,
    #[serde(default, rename = "fieldOrder")]
    pub field_order: Vec<String>,
    #[serde(default, rename = "continueOnParseError")]
    pub continue_on_parse_error: bool,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParquetConfig {
    pub schema: String,
    #[serde(rename = "flushThreshold")]
    pub flush_threshold: Option<u64>,
    #[serde(default)]
    pub partitioning: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderingConfig {
    #[serde(default, rename = "orderBy")]
    pub order_by: Vec<(usize, usize)>,
    #[serde(default, rename = "orderType")]
    pub order_type: OrderType,
}

/// One dataset's full configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageBackend {
    pub dataset: String,
    #[serde(rename = "storageType")]
    pub storage_type: StorageType,

    #[serde(default, rename = "stripProps")]
    pub strip_props: bool,
    #[serde(default, rename = "storeDeleted")]
    pub store_deleted: bool,
    #[serde(default, rename = "resolveNamespace")]
    pub resolve_namespace: bool,
    #[serde(default, rename = "athenaCompatible")]
    pub athena_compatible: bool,

    pub csv: Option<CsvConfig>,
    #[serde(rename = "flatFile")]
    pub flat_file: Option<FlatFileConfig>,
    pub parquet: Option<ParquetConfig>,

    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub props: StorageProps,
    #[serde(default)]
    pub ordering: OrderingConfig,
}

impl StorageBackend {
    /// `true` once a `csv`/`flatFile`/`parquet` block is present; otherwise
    /// the dataset falls back to JSON (spec §3).
    pub fn codec_kind(&self) -> CodecKind {
        if self.parquet.is_some() {
            CodecKind::Parquet
        } else if self.csv.is_some() {
            CodecKind::Csv
        } else if self.flat_file.is_some() {
            CodecKind::FlatFile
        } else if self.athena_compatible {
            CodecKind::Ndjson
        } else {
            CodecKind::Json
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Json,
    Ndjson,
    Csv,
    FlatFile,
    Parquet,
}

/// The whole configuration document: every dataset keyed by name, mirroring
/// `mapColumns` in `original_source/internal/conf/manager.go`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub datasets: Vec<StorageBackend>,
}

impl StorageConfig {
    pub fn by_name(&self, name: &str) -> Option<&StorageBackend> {
        self.datasets.iter().find(|d| d.dataset == name)
    }
}

/// Envelope some config URLs wrap the document in: `{"id": ..., "data": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    data: StorageConfig,
}

fn unpack(raw: &[u8]) -> Result<StorageConfig> {
    if let Ok(env) = serde_json::from_slice::<Envelope>(raw) {
        return Ok(env.data);
    }
    serde_json::from_slice(raw).map_err(|e| DatalayerError::Config(e.to_string()))
}

fn interpolate_secrets(mut cfg: StorageConfig) -> StorageConfig {
    for ds in &mut cfg.datasets {
        if let Some(secret) = &ds.props.secret {
            if let Ok(v) = std::env::var(secret) {
                ds.props.secret = Some(v);
            }
        }
        if let Some(key) = &ds.props.key {
            if let Ok(v) = std::env::var(key) {
                ds.props.key = Some(v);
            }
        }
    }
    cfg
}

/// Holds one atomically-swappable configuration snapshot, reloaded from
/// `CONFIG_LOCATION` on a timer (spec §6, SPEC_FULL §A.3).
pub struct ConfigurationManager {
    location: String,
    snapshot: ArcSwap<StorageConfig>,
    digest: ArcSwap<Option<[u8; 16]>>,
    http: reqwest::Client,
}

impl ConfigurationManager {
    pub async fn load(location: impl Into<String>) -> Result<Self> {
        let location = location.into();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DatalayerError::Config(e.to_string()))?;

        let mgr = ConfigurationManager {
            location,
            snapshot: ArcSwap::from_pointee(StorageConfig::default()),
            digest: ArcSwap::from_pointee(None),
            http,
        };
        mgr.reload().await?;
        Ok(mgr)
    }

    pub fn current(&self) -> Arc<StorageConfig> {
        self.snapshot.load_full()
    }

    /// Fetch the config document, apply MD5 digest gating, swap the
    /// snapshot in on change. A fetch/parse failure leaves the previous
    /// snapshot in force (spec §7) and is returned to the caller for
    /// logging.
    pub async fn reload(&self) -> Result<bool> {
        let raw = self.fetch_raw().await?;

        let mut hasher = Md5::new();
        hasher.update(&raw);
        let digest: [u8; 16] = hasher.finalize().into();

        if self.digest.load().as_ref() == &Some(digest) {
            return Ok(false);
        }

        let cfg = unpack(&raw)?;
        let cfg = interpolate_secrets(cfg);
        self.snapshot.store(Arc::new(cfg));
        self.digest.store(Arc::new(Some(digest)));
        Ok(true)
    }

    async fn fetch_raw(&self) -> Result<Vec<u8>> {
        if let Some(path) = self.location.strip_prefix("file://") {
            return tokio::fs::read(path)
                .await
                .map_err(|e| DatalayerError::Config(format!("reading {path}: {e}")));
        }

        if self.location.starts_with("http://") || self.location.starts_with("https://") {
            let mut last_err = None;
            for attempt in 0..3 {
                match self.http.get(&self.location).send().await {
                    Ok(resp) => match resp.error_for_status() {
                        Ok(resp) => {
                            return resp
                                .bytes()
                                .await
                                .map(|b| b.to_vec())
                                .map_err(|e| DatalayerError::Config(e.to_string()))
                        }
                        Err(e) => last_err = Some(e.to_string()),
                    },
                    Err(e) => last_err = Some(e.to_string()),
                }
                if attempt < 2 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
            return Err(DatalayerError::Config(format!(
                "fetching {}: {}",
                self.location,
                last_err.unwrap_or_default()
            )));
        }

        Err(DatalayerError::Config(format!(
            "unsupported CONFIG_LOCATION scheme: {}",
            self.location
        )))
    }

    /// Spawn the periodic reload task.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.reload().await {
                    Ok(true) => tracing::info!(location = %self.location, "configuration reloaded"),
                    Ok(false) => tracing::debug!("configuration unchanged"),
                    Err(e) => tracing::warn!(error = %e, "configuration reload failed, keeping previous snapshot"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{"datasets":[{"dataset":"s3-plain","storageType":"s3","props":{"bucket":"b"}}]}"#
    }

    #[test]
    fn unpacks_bare_document() {
        let cfg = unpack(sample_json().as_bytes()).unwrap();
        assert_eq!(cfg.datasets.len(), 1);
        assert_eq!(cfg.datasets[0].dataset, "s3-plain");
    }

    #[test]
    fn unpacks_enveloped_document() {
        let wrapped = format!(r#"{{"id":"cfg-1","data":{}}}"#, sample_json());
        let cfg = unpack(wrapped.as_bytes()).unwrap();
        assert_eq!(cfg.datasets[0].dataset, "s3-plain");
    }

    #[test]
    fn property_prefix_parses_key_and_value() {
        let p = PropertyPrefix::parse("kp:vp");
        assert_eq!(p.key_prefix, "kp");
        assert_eq!(p.value_prefix.as_deref(), Some("vp"));

        let p2 = PropertyPrefix::parse("kp");
        assert_eq!(p2.key_prefix, "kp");
        assert_eq!(p2.value_prefix, None);
    }

    #[test]
    fn codec_kind_prefers_parquet_then_csv_then_flatfile_then_ndjson_then_json() {
        let mut backend = StorageBackend {
            dataset: "d".into(),
            storage_type: StorageType::S3,
            strip_props: false,
            store_deleted: false,
            resolve_namespace: false,
            athena_compatible: false,
            csv: None,
            flat_file: None,
            parquet: None,
            decode: DecodeConfig::default(),
            props: StorageProps::default(),
            ordering: OrderingConfig::default(),
        };
        assert_eq!(backend.codec_kind(), CodecKind::Json);
        backend.athena_compatible = true;
        assert_eq!(backend.codec_kind(), CodecKind::Ndjson);
        backend.flat_file = Some(FlatFileConfig::default());
        assert_eq!(backend.codec_kind(), CodecKind::FlatFile);
        backend.csv = Some(CsvConfig::default());
        assert_eq!(backend.codec_kind(), CodecKind::Csv);
        backend.parquet = Some(ParquetConfig::default());
        assert_eq!(backend.codec_kind(), CodecKind::Parquet);
    }
}
