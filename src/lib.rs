//! HTTP-fronted object-storage data layer: ingests entity streams,
//! re-encodes them into JSON, NDJSON, CSV, fixed-width, or Parquet files,
//! and persists them to S3, Azure Blob, or the local filesystem.

pub mod api;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod lowering;
pub mod storage;
