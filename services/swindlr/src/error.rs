//! Error types for pool operations.

use thiserror::Error;

/// Errors surfaced by server-pool operations.
///
/// Configuration and TLS failures are fatal at startup and travel as
/// `anyhow` errors through the binary; pool errors are returned to callers
/// (the admin API among them) and are never fatal.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No pool member matches the given URL string.
    #[error("backend not found with url {0}")]
    BackendNotFound(String),

    /// The backend URL could not be parsed or lacks a host.
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}
