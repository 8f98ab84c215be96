//! The envelope wire format and seal/open operations.
//!
//! An envelope is a self-describing JSON object:
//!
//! ```text
//! { "scheme": "bartholomew.enc.v1",
//!   "alg":    "AES-GCM",
//!   "kid":    "std" | "str" | "...",
//!   "nonce":  base64url(12 bytes),
//!   "aad":    base64url(utf8(canonical-aad)),
//!   "ct":     base64url(ciphertext||tag) }
//! ```
//!
//! Nonces are per-encryption random and never reused. Key rotation replaces
//! `kid` without changing `scheme`. Readers reject on any scheme mismatch.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::aead;
use crate::error::{AuthFailure, EncodingError, ParseError};
use crate::keys::MemoryKey;

/// The one scheme this reader understands.
pub const SCHEME: &str = "bartholomew.enc.v1";

/// The one AEAD algorithm used by v1 envelopes.
pub const ALG_AES_GCM: &str = "AES-GCM";

/// Parsed (or freshly sealed) envelope. Binary fields stay base64url-encoded
/// until they are needed, matching the wire form byte for byte.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub scheme: String,
    pub alg: String,
    pub kid: String,
    pub nonce: String,
    pub aad: String,
    pub ct: String,
}

impl Envelope {
    /// Seal plaintext under `key`, binding it to `aad`.
    pub fn seal(key: &MemoryKey, plaintext: &[u8], aad: &[u8]) -> Result<Self, EncodingError> {
        let (nonce, ct) = aead::seal(key.material(), plaintext, aad)?;
        Ok(Self {
            scheme: SCHEME.into(),
            alg: ALG_AES_GCM.into(),
            kid: key.kid().to_string(),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            aad: URL_SAFE_NO_PAD.encode(aad),
            ct: URL_SAFE_NO_PAD.encode(ct),
        })
    }

    /// Open the envelope with `key`.
    ///
    /// Fails with an opaque [`AuthFailure`] on kid mismatch, any tampered
    /// field, or a key that does not verify the tag.
    pub fn open(&self, key: &MemoryKey) -> Result<Vec<u8>, AuthFailure> {
        if self.scheme != SCHEME || self.alg != ALG_AES_GCM {
            return Err(AuthFailure);
        }
        if self.kid != key.kid() {
            return Err(AuthFailure);
        }
        let nonce_bytes = URL_SAFE_NO_PAD.decode(&self.nonce).map_err(|_| AuthFailure)?;
        let nonce: [u8; aead::NONCE_LEN] =
            nonce_bytes.as_slice().try_into().map_err(|_| AuthFailure)?;
        let aad = URL_SAFE_NO_PAD.decode(&self.aad).map_err(|_| AuthFailure)?;
        let ct = URL_SAFE_NO_PAD.decode(&self.ct).map_err(|_| AuthFailure)?;
        aead::open(key.material(), &nonce, &ct, &aad)
    }

    /// Open, additionally requiring the bound AAD to equal `expected_aad`.
    ///
    /// The AEAD tag already covers the AAD; this check closes the remaining
    /// gap where an attacker substitutes a whole envelope sealed for a
    /// different record slot.
    pub fn open_bound(&self, key: &MemoryKey, expected_aad: &[u8]) -> Result<Vec<u8>, AuthFailure> {
        let aad = URL_SAFE_NO_PAD.decode(&self.aad).map_err(|_| AuthFailure)?;
        if aad != expected_aad {
            return Err(AuthFailure);
        }
        self.open(key)
    }

    /// Parse envelope JSON, rejecting unknown schemes and algorithms.
    pub fn from_json(text: &str) -> Result<Self, ParseError> {
        let env: Envelope = serde_json::from_str(text).map_err(|_| ParseError::NotAnEnvelope)?;
        if env.scheme != SCHEME {
            return Err(ParseError::SchemeMismatch(env.scheme));
        }
        if env.alg != ALG_AES_GCM {
            return Err(ParseError::UnsupportedAlg(env.alg));
        }
        URL_SAFE_NO_PAD
            .decode(&env.nonce)
            .ok()
            .filter(|n| n.len() == aead::NONCE_LEN)
            .ok_or(ParseError::MalformedField("nonce"))?;
        URL_SAFE_NO_PAD
            .decode(&env.aad)
            .map_err(|_| ParseError::MalformedField("aad"))?;
        URL_SAFE_NO_PAD
            .decode(&env.ct)
            .map_err(|_| ParseError::MalformedField("ct"))?;
        Ok(env)
    }

    /// Serialize to the canonical wire JSON.
    pub fn to_json(&self) -> String {
        // Field order is fixed by the struct; serialization cannot fail.
        serde_json::to_string(self).expect("envelope serialization")
    }

    /// Cheap test: does this text look like (and parse as) a v1 envelope?
    ///
    /// Used by the store to distinguish plaintext values from encrypted ones
    /// without a separate flag column — envelopes are self-describing.
    pub fn is_envelope(text: &str) -> bool {
        text.starts_with('{') && Self::from_json(text).is_ok()
    }

    /// The decoded AAD bytes, if well-formed.
    pub fn aad_bytes(&self) -> Option<Vec<u8>> {
        URL_SAFE_NO_PAD.decode(&self.aad).ok()
    }
}

/// `Debug` omits ciphertext and AAD: record identity and payload size stay
/// out of logs.
impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("scheme", &self.scheme)
            .field("alg", &self.alg)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}
