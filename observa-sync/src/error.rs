//! Error types for observa-sync.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from sink operations.
///
/// The diff engine and resolver catch these at per-record or per-kind
/// granularity; they only reach the caller from startup (`open_sink`) and the
/// per-cycle commit.
#[derive(Debug, Error)]
pub enum SinkError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Embedded store error.
    #[error("sink database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The snapshot endpoint could not be reached.
    #[error("sink endpoint unreachable: {0}")]
    Transport(String),

    /// The snapshot endpoint answered outside the 2xx range.
    #[error("sink endpoint returned status {0}")]
    Status(u16),

    /// JSON serialization error (attribute maps, snapshot bodies).
    #[error("sink JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The shared connection lock was poisoned by a panicking writer.
    #[error("sink connection lock poisoned")]
    LockPoisoned,
}

/// Convenience constructor for [`SinkError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.into(),
        source,
    }
}
