//! Error types for ClueGetter

use thiserror::Error;

/// Main error type for ClueGetter
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Resolver error: {0}")]
    Resolver(String),

    #[error("Module error: {0}")]
    Module(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ClueGetter
pub type Result<T> = std::result::Result<T, Error>;
