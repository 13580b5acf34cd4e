//! Handshake signatures — ML-DSA-65 (Dilithium3, NIST FIPS 204)
//!
//! Detached signatures over the canonical handshake encoding. Keys and
//! signatures cross the wire as raw bytes.

use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("signing key generation failed")]
    KeyGenFailed,
    #[error("invalid signing key length")]
    InvalidKeyLength,
    #[error("invalid signature encoding")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, SignError>;

/// An ML-DSA-65 keypair held as raw bytes. The secret half is zeroized
/// on drop.
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: Vec<u8>,
    pub secret: Vec<u8>,
}

impl Drop for SigningKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Generate a fresh ML-DSA-65 keypair.
pub fn generate_keypair() -> SigningKeypair {
    let (pk, sk) = dilithium3::keypair();
    SigningKeypair {
        public: pk.as_bytes().to_vec(),
        secret: sk.as_bytes().to_vec(),
    }
}

/// Produce a detached signature over `message`.
pub fn sign(message: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
    let sk = dilithium3::SecretKey::from_bytes(secret).map_err(|_| SignError::InvalidKeyLength)?;
    let sig = dilithium3::detached_sign(message, &sk);
    Ok(sig.as_bytes().to_vec())
}

/// Verify a detached signature. Returns `false` for any well-formed but
/// non-verifying signature; malformed key or signature encodings are
/// reported as errors.
pub fn verify(message: &[u8], signature: &[u8], public: &[u8]) -> Result<bool> {
    let pk = dilithium3::PublicKey::from_bytes(public).map_err(|_| SignError::InvalidKeyLength)?;
    let sig = dilithium3::DetachedSignature::from_bytes(signature)
        .map_err(|_| SignError::InvalidSignature)?;
    Ok(dilithium3::verify_detached_signature(&sig, message, &pk).is_ok())
}
