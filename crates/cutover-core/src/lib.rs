//! cutover-core: shared domain types and daemon configuration.

pub mod config;
pub mod types;

pub use config::{ConfigError, CutoverConfig};
pub use types::*;
