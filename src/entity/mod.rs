//! Entity wire types and the incremental array-stream parser (spec §3, §4.1).

pub mod model;
pub mod parser;

pub use model::{Context, Continuation, Entity};
pub use parser::{parse_stream, DEFAULT_BATCH_SIZE};
