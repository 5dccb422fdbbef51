pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ConfigError, ConfigurationError};
pub use types::*;
