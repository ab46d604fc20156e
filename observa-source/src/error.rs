//! Error taxonomy for inventory-source calls.
//!
//! Every variant is non-fatal to the process: the reconciliation core catches
//! these per call, logs them, and relies on the next cycle to self-heal. Only
//! the startup probe is allowed to turn one of these into process exit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be reached (DNS, connect, timeout, 5xx).
    #[error("inventory source unreachable: {0}")]
    Connectivity(String),

    /// Credentials were rejected.
    #[error("inventory source rejected credentials (status {0})")]
    Auth(u16),

    /// The requested path does not exist. A configuration problem, not an
    /// empty collection.
    #[error("inventory source path not found: {path}")]
    NotFound { path: String },

    /// The response body could not be decoded.
    #[error("failed to decode source response: {0}")]
    Decode(String),
}
