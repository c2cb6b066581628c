//! Common error type for the EchoMail workspace.

use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, EchomailError>;

/// All the ways EchoMail can fail.
#[derive(Debug, Error)]
pub enum EchomailError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Mail transport error: {0}")]
    Mail(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}