//! Post-Quantum Key Encapsulation — ML-KEM-768 (NIST FIPS 203)
//!
//! Thin adapter over the `ml-kem` crate working on raw byte buffers so
//! the ratchet and handshake layers never touch typed key material.
//!
//! Key sizes (ML-KEM-768):
//! - Encapsulation key (public):  1184 bytes
//! - Decapsulation key (secret):  2400 bytes
//! - Ciphertext:                  1088 bytes
//! - Shared secret:               32 bytes

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroize;

/// ML-KEM-768 encapsulation key size in bytes
pub const MLKEM768_EK_BYTES: usize = 1184;
/// ML-KEM-768 decapsulation key size in bytes
pub const MLKEM768_DK_BYTES: usize = 2400;
/// ML-KEM-768 ciphertext size in bytes
pub const MLKEM768_CT_BYTES: usize = 1088;
/// Shared secret size in bytes
pub const SHARED_SECRET_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum KemError {
    #[error("ML-KEM key generation failed")]
    KeyGenFailed,
    #[error("ML-KEM encapsulation failed")]
    EncapsulateFailed,
    #[error("ML-KEM decapsulation failed")]
    DecapsulateFailed,
    #[error("invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, KemError>;

/// An ML-KEM-768 keypair held as raw bytes. The decapsulation key is
/// zeroized on drop.
#[derive(Clone)]
pub struct KemKeypair {
    pub public: Vec<u8>,
    pub secret: Vec<u8>,
}

impl Drop for KemKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Generate a fresh ML-KEM-768 keypair.
pub fn generate_keypair() -> Result<KemKeypair> {
    let (dk, ek) = MlKem768::generate(&mut OsRng);
    Ok(KemKeypair {
        public: ek.as_bytes().to_vec(),
        secret: dk.as_bytes().to_vec(),
    })
}

/// Encapsulate to a peer's raw encapsulation key.
///
/// Returns `(ciphertext, shared_secret)`.
pub fn encapsulate(public: &[u8]) -> Result<(Vec<u8>, [u8; SHARED_SECRET_BYTES])> {
    if public.len() != MLKEM768_EK_BYTES {
        return Err(KemError::InvalidKeyLength);
    }

    let ek_encoded = Encoded::<ml_kem::kem::EncapsulationKey<MlKem768Params>>::try_from(public)
        .map_err(|_| KemError::InvalidKeyLength)?;
    let ek = ml_kem::kem::EncapsulationKey::<MlKem768Params>::from_bytes(&ek_encoded);

    let (ct, ss) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| KemError::EncapsulateFailed)?;

    let mut shared = [0u8; SHARED_SECRET_BYTES];
    shared.copy_from_slice(ss.as_ref());

    Ok((ct.iter().copied().collect(), shared))
}

/// Decapsulate a ciphertext with our raw decapsulation key.
pub fn decapsulate(ciphertext: &[u8], secret: &[u8]) -> Result<[u8; SHARED_SECRET_BYTES]> {
    if ciphertext.len() != MLKEM768_CT_BYTES {
        return Err(KemError::InvalidKeyLength);
    }
    if secret.len() != MLKEM768_DK_BYTES {
        return Err(KemError::InvalidKeyLength);
    }

    let dk_encoded = Encoded::<ml_kem::kem::DecapsulationKey<MlKem768Params>>::try_from(secret)
        .map_err(|_| KemError::InvalidKeyLength)?;
    let dk = ml_kem::kem::DecapsulationKey::<MlKem768Params>::from_bytes(&dk_encoded);

    let ct = ml_kem::Ciphertext::<MlKem768>::try_from(ciphertext)
        .map_err(|_| KemError::InvalidKeyLength)?;

    let ss = dk.decapsulate(&ct).map_err(|_| KemError::DecapsulateFailed)?;

    let mut shared = [0u8; SHARED_SECRET_BYTES];
    shared.copy_from_slice(ss.as_ref());
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sizes() {
        let kp = generate_keypair().unwrap();
        assert_eq!(kp.public.len(), MLKEM768_EK_BYTES);
        assert_eq!(kp.secret.len(), MLKEM768_DK_BYTES);
    }

    #[test]
    fn test_encapsulate_decapsulate() {
        let kp = generate_keypair().unwrap();
        let (ct, ss) = encapsulate(&kp.public).unwrap();
        assert_eq!(ct.len(), MLKEM768_CT_BYTES);

        let recovered = decapsulate(&ct, &kp.secret).unwrap();
        assert_eq!(ss, recovered);
    }

    #[test]
    fn test_different_encapsulations_differ() {
        let kp = generate_keypair().unwrap();
        let (_, ss1) = encapsulate(&kp.public).unwrap();
        let (_, ss2) = encapsulate(&kp.public).unwrap();
        assert_ne!(ss1, ss2);
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(encapsulate(&[0u8; 16]).is_err());
        assert!(decapsulate(&[0u8; 16], &[0u8; MLKEM768_DK_BYTES]).is_err());
        assert!(decapsulate(&[0u8; MLKEM768_CT_BYTES], &[0u8; 16]).is_err());
    }
}
