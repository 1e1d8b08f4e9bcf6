use thiserror::Error;

/// Errors raised outside the per-packet hot path: configuration, plugin
/// loading, and other startup/control-plane failures.
///
/// Per-packet parse outcomes are never an `EngineError` — see [`crate::proto::ParseStatus`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("netmatch error: {0}")]
    Netmatch(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
