//! Error types for the memory kernel.
//!
//! Messages never carry plaintext values, summaries, key material, nonces,
//! or AAD — record ids and kinds are the only identifying context allowed.

use std::fmt;

#[derive(Debug)]
pub enum MemoryError {
    /// The parking brake covers this operation's scope.
    BrakeEngaged { scope: &'static str },
    /// Encryption was demanded but could not be performed, or stored
    /// material failed authentication where that is fatal.
    Crypto(String),
    /// FTS or vector backend failure.
    Index(String),
    /// Underlying record-store failure.
    Store(String),
    /// Invalid configuration (fatal at startup).
    Config(String),
    /// Embedding computation failed where a rule demanded persistence.
    Embed(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrakeEngaged { scope } => write!(f, "parking brake engaged for scope: {}", scope),
            Self::Crypto(msg) => write!(f, "crypto error: {}", msg),
            Self::Index(msg) => write!(f, "index error: {}", msg),
            Self::Store(msg) => write!(f, "store error: {}", msg),
            Self::Config(msg) => write!(f, "config error: {}", msg),
            Self::Embed(msg) => write!(f, "embedding error: {}", msg),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Store(e.to_string())
    }
}

impl From<bartho_envelope::EncodingError> for MemoryError {
    fn from(_: bartho_envelope::EncodingError) -> Self {
        MemoryError::Crypto("envelope seal failed".into())
    }
}

impl From<bartho_envelope::KeyError> for MemoryError {
    fn from(e: bartho_envelope::KeyError) -> Self {
        MemoryError::Crypto(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
