//! HTTP surface: dataset dispatch handlers and error-to-status mapping
//! (spec §4.11).

mod errors;
pub mod handlers;
mod stream;

pub use handlers::{router, AppState};
