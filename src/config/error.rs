use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config declares no programs")]
    NoPrograms,
    #[error("config declares no valid programs")]
    NoValidPrograms,
    #[error("missing '{field}' for program '{program}'")]
    MissingField {
        program: String,
        field: &'static str,
    },
    #[error("invalid '{field}' value '{value}' for program '{program}'")]
    InvalidValue {
        program: String,
        field: &'static str,
        value: String,
    },
    #[error("'{field}' for program '{program}' must be at least {minimum}")]
    BelowMinimum {
        program: String,
        field: &'static str,
        minimum: u64,
    },
    #[error("unknown restart policy '{value}' for program '{program}'")]
    UnknownRestartPolicy { program: String, value: String },
    #[error("unknown stop signal '{value}' for program '{program}'")]
    UnknownStopSignal { program: String, value: String },
    #[error("umask '{value}' for program '{program}' is outside [0, 0o777]")]
    UmaskOutOfRange { program: String, value: String },
    #[error("invalid listen address '{value}' for global '{field}'")]
    InvalidListenAddr { field: &'static str, value: String },
    #[error("global loglevel {value} is outside 0..=3")]
    LogLevelOutOfRange { value: u64 },
}

impl ConfigError {
    /// Name of the program a per-program validation error belongs to.
    pub fn program(&self) -> Option<&str> {
        match self {
            ConfigError::MissingField { program, .. }
            | ConfigError::InvalidValue { program, .. }
            | ConfigError::BelowMinimum { program, .. }
            | ConfigError::UnknownRestartPolicy { program, .. }
            | ConfigError::UnknownStopSignal { program, .. }
            | ConfigError::UmaskOutOfRange { program, .. } => Some(program),
            _ => None,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
