//! Configuration for the diagnostic engine
//!
//! Configuration is a single YAML document. String values may reference
//! environment variables as `${VAR}` or `${VAR:-default}`; substitution runs
//! before deserialisation.

pub mod loader;
pub mod types;

pub use loader::{load_config, parse_config, resolve_config_path, substitute_env_vars, ConfigError};
pub use types::*;
