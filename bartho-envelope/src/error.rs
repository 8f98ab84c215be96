//! Unified error types for the Bartholomew envelope.

use core::fmt;

/// Decryption failed. Deliberately opaque: the caller learns nothing about
/// whether the AAD, ciphertext, tag, or key was at fault (oracle discipline).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthFailure;

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "envelope authentication failed")
    }
}

impl std::error::Error for AuthFailure {}

/// Encrypt-path failure (RNG, cipher construction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingError;

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "envelope encoding error")
    }
}

impl std::error::Error for EncodingError {}

/// A stored value failed to parse as an envelope of the supported scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The `scheme` field did not match the supported scheme.
    SchemeMismatch(String),
    /// The `alg` field named an unsupported algorithm.
    UnsupportedAlg(String),
    /// A binary field failed base64url decoding, or had the wrong length.
    MalformedField(&'static str),
    /// Not valid envelope JSON at all.
    NotAnEnvelope,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemeMismatch(s) => write!(f, "unsupported envelope scheme: {}", s),
            Self::UnsupportedAlg(a) => write!(f, "unsupported envelope alg: {}", a),
            Self::MalformedField(name) => write!(f, "malformed envelope field: {}", name),
            Self::NotAnEnvelope => write!(f, "not an envelope"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Normalize parse errors into auth failures on the decrypt path.
impl From<ParseError> for AuthFailure {
    fn from(_: ParseError) -> Self {
        AuthFailure
    }
}

/// Key provider failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// No key registered for the requested strength or kid.
    MissingKey(String),
    /// Key material could not be decoded (bad hex, wrong length).
    BadMaterial(String),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey(which) => write!(f, "no key for: {}", which),
            Self::BadMaterial(which) => write!(f, "bad key material for: {}", which),
        }
    }
}

impl std::error::Error for KeyError {}
