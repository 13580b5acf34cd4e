//! Authenticated encryption — XChaCha20-Poly1305
//!
//! The key schedule derives a 16-byte nonce per message; the cipher
//! takes a 24-byte XNonce, so the derived value is zero-extended.
//! Message keys are single-use, which keeps the (key, nonce) pair
//! unique without tracking nonce state.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};

use crate::error::SessionError;

/// Protocol-level nonce length (derived by the key schedule).
pub const NONCE_LEN: usize = 16;

fn cipher(key: &[u8; 32]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new_from_slice(key).expect("32-byte key")
}

fn extend_nonce(nonce: &[u8; NONCE_LEN]) -> XNonce {
    let mut wide = [0u8; 24];
    wide[..NONCE_LEN].copy_from_slice(nonce);
    XNonce::from(wide)
}

/// Seal `plaintext` under `key`/`nonce`, binding `aad`.
pub fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, SessionError> {
    cipher(key)
        .encrypt(
            &extend_nonce(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SessionError::AuthenticationFailed)
}

/// Open a sealed buffer. Any tag or AAD mismatch reports
/// `AuthenticationFailed`.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, SessionError> {
    cipher(key)
        .decrypt(
            &extend_nonce(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SessionError::AuthenticationFailed)
}
