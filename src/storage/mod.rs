//! Object-storage backends, key composition, and the full-sync session
//! machinery on top of them (spec §4.8-§4.10).

pub mod azure;
pub mod console;
pub mod engine;
pub mod keygen;
pub mod local;
pub mod s3;
pub mod session;
pub mod traits;

pub use engine::StorageEngine;
pub use traits::{FullSyncUpload, ObjectStorage};
