//! Error type shared by all revision store components

use std::path::PathBuf;

/// Errors from revision store operations.
#[derive(Debug, thiserror::Error)]
pub enum RcsError {
    /// I/O failure against the store's directory tree.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unwritable XML in a metadata or log file.
    #[error("XML error in {path}: {reason}")]
    Xml { path: PathBuf, reason: String },

    /// A uuid or path could not be resolved to a live resource.
    #[error("identity error: {0}")]
    Identity(String),

    /// Content hash mismatch on blob read (data corruption).
    #[error("integrity error: expected {expected}, computed {computed}")]
    Integrity { expected: String, computed: String },

    /// A revision folder or log id could not be claimed within the retry budget.
    #[error("id allocation exhausted after {attempts} attempts for {what}")]
    CollisionExhausted { what: String, attempts: u32 },

    /// Failure surfaced by the live-store collaborator.
    #[error("live store error: {0}")]
    Live(String),
}

impl RcsError {
    /// Attach a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an XML error for the given file.
    pub fn xml(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Xml {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for RcsError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

/// Result alias used throughout the revision store.
pub type Result<T> = std::result::Result<T, RcsError>;
