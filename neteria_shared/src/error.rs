//! Error types shared by the client and server engines.

use thiserror::Error;

/// Errors surfaced to callers of the public engine API.
///
/// Decode failures are deliberately not represented here: a datagram that
/// fails to decode (bad JSON, bad compression, bad ciphertext) is dropped
/// silently by the engine and never reaches a caller as an `Err`.
#[derive(Debug, Error)]
pub enum NeteriaError {
    #[error("outgoing datagram of {size} bytes exceeds the configured limit of {limit} bytes")]
    DatagramTooLarge { size: usize, limit: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, NeteriaError>;
