//! Crate-wide error kinds.
//!
//! One flat `thiserror` enum that every subsystem converts into; the HTTP
//! layer maps it to a status code only at the edge (see `DESIGN.md`).

use thiserror::Error;

/// Error kinds named in spec §7.
#[derive(Debug, Error)]
pub enum DatalayerError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("entity record is missing its required id field")]
    MissingId,

    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("full-sync session conflict: {0}")]
    SessionConflict(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("storage backend io error: {0}")]
    UpstreamIo(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("downstream callback error: {0}")]
    Downstream(String),
}

impl DatalayerError {
    /// The message surfaced to HTTP clients (spec §8 scenario b expects the
    /// bare reason, not the internal `Display` prefix used in logs).
    pub fn client_message(&self) -> String {
        match self {
            DatalayerError::Unsupported(reason)
            | DatalayerError::SessionConflict(reason)
            | DatalayerError::Malformed(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for DatalayerError {
    fn from(e: std::io::Error) -> Self {
        DatalayerError::UpstreamIo(e.to_string())
    }
}

impl From<serde_json::Error> for DatalayerError {
    fn from(e: serde_json::Error) -> Self {
        DatalayerError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DatalayerError>;
