use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a recognition engine capability call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// `start` was called on an engine that is still running. The logical
    /// state and the engine's actual state have drifted apart.
    #[error("recognition engine is already started")]
    InvalidState,
    #[error("speech recognition is not available on this platform")]
    Unsupported,
    #[error("recognition engine failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The voice service task is gone
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("voice service has shut down")]
    Closed,
}
