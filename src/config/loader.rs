//! Configuration loading from disk.

use std::path::Path;

use thiserror::Error;

use crate::config::schema::MirrorConfig;
use crate::config::validation::{build_runtime, RuntimeConfig, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load a raw configuration from a TOML file without semantic validation.
pub fn load_config(path: &Path) -> Result<MirrorConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: MirrorConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Load, parse, and validate a configuration file into its runtime form.
pub fn load_runtime(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let config = load_config(path)?;
    build_runtime(&config).map_err(ConfigError::Validation)
}
