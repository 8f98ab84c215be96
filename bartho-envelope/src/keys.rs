//! Key provider: resolves strength-tagged 32-byte symmetric keys.
//!
//! Two strengths exist (`standard`, `strong`), each carrying a stable key-id
//! that is written into every envelope it seals. Key material comes from, in
//! order of preference:
//!
//! 1. explicit hex material handed to [`KeyProvider::from_material`],
//! 2. the `BARTHO_KEY_STANDARD` / `BARTHO_KEY_STRONG` environment secrets,
//!    expanded to 32 bytes with HKDF-SHA256,
//! 3. a synthesized ephemeral random key (logged once per process).
//!
//! A synthesized key still records a real `kid` derived from the key bytes,
//! so envelopes sealed under it fail decryption *attributably* after a
//! restart instead of looking like silent corruption.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::sync::Once;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KeyError;

/// Env vars consulted by [`KeyProvider::from_env`].
pub const ENV_KEY_STANDARD: &str = "BARTHO_KEY_STANDARD";
pub const ENV_KEY_STRONG: &str = "BARTHO_KEY_STRONG";

/// HKDF info prefix for deriving key material from environment secrets.
const DERIVE_INFO_PREFIX: &[u8] = b"bartholomew|key|v1|";

// ---------------------------------------------------------------------------
// Strength
// ---------------------------------------------------------------------------

/// Encryption strength tag from a rule decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strength {
    Standard,
    Strong,
}

impl Strength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strength::Standard => "standard",
            Strength::Strong => "strong",
        }
    }

    /// Default kid for config-supplied material of this strength.
    pub fn default_kid(&self) -> &'static str {
        match self {
            Strength::Standard => "std",
            Strength::Strong => "str",
        }
    }
}

impl std::fmt::Display for Strength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// A 32-byte symmetric key with its stable key-id.
///
/// The material is zeroized on drop and never printed: the `Debug` impl
/// shows only the kid.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MemoryKey {
    #[zeroize(skip)]
    kid: String,
    key: [u8; 32],
}

impl MemoryKey {
    /// Wrap raw 32-byte material under an explicit kid.
    pub fn new(kid: impl Into<String>, key: [u8; 32]) -> Self {
        Self { kid: kid.into(), key }
    }

    /// Decode hex material (64 hex chars) under an explicit kid.
    pub fn from_hex(kid: impl Into<String>, hex_key: &str) -> Result<Self, KeyError> {
        let kid = kid.into();
        let bytes = decode_hex(hex_key).ok_or_else(|| KeyError::BadMaterial(kid.clone()))?;
        if bytes.len() != 32 {
            return Err(KeyError::BadMaterial(kid));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self { kid, key })
    }

    /// Derive material from an arbitrary-length secret with HKDF-SHA256.
    ///
    /// The strength label is folded into the HKDF info so the same secret
    /// yields independent `standard` and `strong` keys.
    pub fn derive(kid: impl Into<String>, secret: &[u8], strength: Strength) -> Self {
        let mut info = Vec::with_capacity(DERIVE_INFO_PREFIX.len() + 8);
        info.extend_from_slice(DERIVE_INFO_PREFIX);
        info.extend_from_slice(strength.as_str().as_bytes());

        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; 32];
        // expand() only fails for oversized output; 32 bytes always fits.
        hk.expand(&info, &mut key).expect("hkdf expand 32 bytes");
        Self { kid: kid.into(), key }
    }

    /// Synthesize a random ephemeral key. The kid is derived from the key
    /// bytes (`eph-` + 8 hex chars) so it is stable for the process lifetime.
    pub fn synthesize(strength: Strength) -> Result<Self, KeyError> {
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key)
            .map_err(|_| KeyError::BadMaterial(strength.as_str().into()))?;
        let digest = Sha256::digest(key);
        let kid = format!("eph-{}", encode_hex(&digest[..4]));
        Ok(Self { kid, key })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn material(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for MemoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

static EPHEMERAL_WARNING: Once = Once::new();

/// Resolves `standard` and `strong` keys and looks keys up by kid for the
/// decrypt path.
pub struct KeyProvider {
    standard: MemoryKey,
    strong: MemoryKey,
}

impl KeyProvider {
    /// Build from explicit material.
    pub fn from_material(standard: MemoryKey, strong: MemoryKey) -> Self {
        Self { standard, strong }
    }

    /// Build from hex-encoded config material `(kid, 64-hex-char key)`.
    pub fn from_hex(
        standard: (&str, &str),
        strong: (&str, &str),
    ) -> Result<Self, KeyError> {
        Ok(Self {
            standard: MemoryKey::from_hex(standard.0, standard.1)?,
            strong: MemoryKey::from_hex(strong.0, strong.1)?,
        })
    }

    /// Build from the environment, synthesizing ephemeral keys where the
    /// secrets are absent. The synthesis warning is logged once per process.
    pub fn from_env() -> Result<Self, KeyError> {
        let mut synthesized = false;
        let standard = Self::env_key(ENV_KEY_STANDARD, Strength::Standard, &mut synthesized)?;
        let strong = Self::env_key(ENV_KEY_STRONG, Strength::Strong, &mut synthesized)?;
        if synthesized {
            EPHEMERAL_WARNING.call_once(|| {
                tracing::warn!(
                    "no persistent key material configured; using ephemeral keys \
                     (encrypted records will not survive a restart)"
                );
            });
        }
        Ok(Self { standard, strong })
    }

    fn env_key(
        var: &str,
        strength: Strength,
        synthesized: &mut bool,
    ) -> Result<MemoryKey, KeyError> {
        match std::env::var(var) {
            Ok(secret) if !secret.is_empty() => {
                Ok(MemoryKey::derive(strength.default_kid(), secret.as_bytes(), strength))
            }
            _ => {
                *synthesized = true;
                MemoryKey::synthesize(strength)
            }
        }
    }

    /// Resolve the key for a strength tag.
    pub fn resolve(&self, strength: Strength) -> &MemoryKey {
        match strength {
            Strength::Standard => &self.standard,
            Strength::Strong => &self.strong,
        }
    }

    /// Look up a key by kid (decrypt path). Returns `None` for unknown kids,
    /// which the caller surfaces as an authentication failure.
    pub fn by_kid(&self, kid: &str) -> Option<&MemoryKey> {
        if self.standard.kid() == kid {
            Some(&self.standard)
        } else if self.strong.kid() == kid {
            Some(&self.strong)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Hex helpers (kept local: material never transits a general-purpose encoder)
// ---------------------------------------------------------------------------

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if !s.is_ascii() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
