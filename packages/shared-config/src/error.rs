//! Errors raised while reading service settings

use thiserror::Error;

/// A setting is absent, unparsable or inconsistent with another one
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A setting without a default was not provided
    #[error("{0} is not set")]
    MissingEnvVar(String),

    /// A setting could not be parsed or is out of range
    #[error("{0} has an unusable value: {1}")]
    InvalidValue(String, String),

    /// Settings that are fine alone but not together
    #[error("conflicting settings: {0}")]
    Conflict(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
