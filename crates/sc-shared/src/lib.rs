//! Shared types for sc-agent: error taxonomy and admin API payloads.

pub mod error;
pub mod problem;
pub mod status;

pub use error::ScError;
pub use problem::Problem;

/// Crate version, used in status payloads and logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
