//! # Bartholomew Envelope
//!
//! Authenticated encryption envelope for the memory kernel.
//!
//! A sealed value travels as a self-describing JSON envelope: AES-256-GCM
//! ciphertext with a canonical AAD binding it to the `(kind, key, ts)`
//! identity of the record that owns it. The [`KeyProvider`] resolves the two
//! strength tags (`standard`, `strong`) to 32-byte keys, each with a stable
//! key-id recorded in the envelope for rotation and post-restart diagnosis.
//!
//! ## Quick start
//!
//! ```
//! use bartho_envelope::{aad, Envelope, KeyProvider, MemoryKey, Strength};
//!
//! let provider = KeyProvider::from_material(
//!     MemoryKey::new("std", [1u8; 32]),
//!     MemoryKey::new("str", [2u8; 32]),
//! );
//!
//! let binding = aad::record_aad("chat", "k1", "2026-01-01T00:00:00Z");
//! let key = provider.resolve(Strength::Standard);
//! let env = Envelope::seal(key, b"redacted text", &binding).unwrap();
//!
//! let restored = provider.by_kid(&env.kid).unwrap();
//! assert_eq!(env.open_bound(restored, &binding).unwrap(), b"redacted text");
//! ```

pub mod aad;
pub mod aead;
pub mod envelope;
pub mod error;
pub mod keys;

pub use envelope::{Envelope, ALG_AES_GCM, SCHEME};
pub use error::{AuthFailure, EncodingError, KeyError, ParseError};
pub use keys::{KeyProvider, MemoryKey, Strength, ENV_KEY_STANDARD, ENV_KEY_STRONG};
