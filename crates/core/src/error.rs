//! Workspace-level error types.

use thiserror::Error;

/// Top-level error type for application code.
#[derive(Error, Debug)]
pub enum Error {
    /// Startup configuration errors (missing device capability, bad settings)
    #[error("Config error: {0}")]
    Config(String),

    /// Graphics subsystem errors surfaced to the application layer
    #[error("Graphics error: {0}")]
    Graphics(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the workspace `Error`.
pub type Result<T> = std::result::Result<T, Error>;
