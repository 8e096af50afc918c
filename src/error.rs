//! Crate error types.
//!
//! Per-message failures are surfaced as booleans or outcome enums at the
//! call sites that care (a closed stream makes `send` return `false`, a
//! missed pong makes `ping` return `false`). The variants here are the
//! typed kinds callers actually match on.

/// Errors produced by the overlay core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A node identifier was not exactly 20 bytes / 40 hex characters.
    #[error("invalid node id: {0}")]
    InvalidId(String),

    /// An inbound frame could not be parsed as a known message.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    /// The operation is not supported by this cache variant.
    #[error("{0} is not supported by this cache strategy")]
    Unsupported(&'static str),

    /// Reading or writing persisted node state failed.
    #[error(transparent)]
    Persistence(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;
