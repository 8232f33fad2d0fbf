//! Consolidated error types for the icu-firewall library.
//!
//! Library modules use `crate::error::{Error, Result}`. The binary
//! crate uses `anyhow` at its boundary. Errors that only degrade a
//! scan (unreadable file, unavailable store) are handled inline and
//! never surface through this type; these variants cover failures the
//! caller must see.

use std::path::PathBuf;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for icu-firewall library operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // -- Policy --
    #[error("policy load failed in section '{section}': {reason}")]
    PolicyLoad { section: String, reason: String },
    #[error("policy file not found: {path}")]
    PolicyNotFound { path: PathBuf },

    // -- Scan targets --
    #[error("target does not exist: {path}")]
    TargetMissing { path: PathBuf },

    // -- Rules --
    #[error("invalid regex in rule {rule_id}: {reason}")]
    InvalidRegex { rule_id: String, reason: String },

    // -- Reputation store --
    #[error("reputation store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("failed to import threat signatures from {path}: {reason}")]
    SignatureImport { path: PathBuf, reason: String },

    // -- Watcher --
    #[error("watcher error: {0}")]
    Watch(String),

    // -- Generic --
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io {
            context: "I/O error".to_string(),
            source,
        }
    }
}
