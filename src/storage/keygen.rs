//! Object-key composition (spec §4.8). Grounded on
//! `original_source/internal/store/s3.go` (`createKey`).

use crate::config::StorageBackend;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub fn dataset_prefix(dataset: &str) -> String {
    format!("datasets/{dataset}/")
}

fn partition_value(part: &str, now: DateTime<Utc>) -> String {
    match part {
        "year" => now.format("%Y").to_string(),
        "month" => now.format("%-m").to_string(),
        "day" => now.format("%-d").to_string(),
        other => other.to_string(),
    }
}

/// `datasets/<dataset>/<bucket-part>/<partition-path>/<prefix><recorded>-<uuid>.<ext>`
pub fn object_key(
    backend: &StorageBackend,
    bucket_part: &str,
    recorded: Option<&str>,
    ext: &str,
    now: DateTime<Utc>,
) -> String {
    let mut path = format!("{}{bucket_part}/", dataset_prefix(&backend.dataset));

    if bucket_part == "changes" {
        if let Some(parquet) = &backend.parquet {
            for part in &parquet.partitioning {
                path.push_str(&format!("{part}={}/", partition_value(part, now)));
            }
        }
    }

    let prefix = backend.props.file_prefix.as_deref().unwrap_or("");
    let recorded_part = recorded.map(|r| format!("{r}-")).unwrap_or_default();
    let uuid = Uuid::new_v4();
    format!("{path}{prefix}{recorded_part}{uuid}.{ext}")
}

/// The fixed-resource fullsync path, when `resourceName` is configured.
/// `None` means the dataset has no fixed resource and fullsync objects are
/// keyed like any other `entities/…` object.
pub fn fullsync_resource_path(backend: &StorageBackend) -> Option<String> {
    let name = backend.props.resource_name.as_ref()?;
    if backend.props.custom_resource_path.unwrap_or(false) {
        Some(name.clone())
    } else {
        Some(format!("{}latest/{name}", dataset_prefix(&backend.dataset)))
    }
}
