//! Crate-wide error type.
//!
//! Failure classes map to how callers recover: configuration errors are
//! fatal at construction, capacity is the producer's backpressure
//! signal, auth aborts a peer connection, integrity flags state that
//! disagrees with itself.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CepError {
    /// Invalid pattern, event or config input, detected at construction.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Internal state disagreement, e.g. a duplicate run identity.
    #[error("integrity: {0}")]
    Integrity(String),

    /// A bounded queue refused an item; the producer decides what to
    /// shed.
    #[error("queue {queue} full (capacity {capacity})")]
    Capacity {
        queue: &'static str,
        capacity: usize,
    },

    /// Peer authentication or frame decryption failure.
    #[error("auth: {0}")]
    Auth(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CepError>;
