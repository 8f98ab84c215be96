//! AEAD layer: AES-256-GCM under the kernel's record-identity bindings.
//!
//! Sealing draws a fresh 96-bit nonce from the OS on every call and hands it
//! back for the envelope to record; no caller can supply one, so nonce reuse
//! is impossible by construction. The AAD passed through here is always one
//! of the canonical record/summary bindings from [`crate::aad`], which means
//! a ciphertext authenticates both its content and the slot it belongs to.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{AuthFailure, EncodingError};

/// GCM nonce width, as recorded in the envelope's `nonce` field.
pub const NONCE_LEN: usize = 12;

/// Encrypt under a fresh random nonce.
///
/// Returns the nonce alongside `ciphertext || tag`; the envelope stores both.
pub fn seal(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), EncodingError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| EncodingError)?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncodingError)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| EncodingError)?;
    Ok((nonce, ciphertext))
}

/// Decrypt and verify a sealed payload.
///
/// A mismatch in key, nonce, ciphertext, tag, or binding all collapse into
/// the same opaque [`AuthFailure`].
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AuthFailure> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AuthFailure)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| AuthFailure)
}
