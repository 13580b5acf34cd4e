use thiserror::Error;

use crate::crypto::pqc::KemError;
use crate::crypto::signing::SignError;

/// Public error taxonomy for session operations.
///
/// `SemanticTagMismatch`, `AuthenticationFailed` and
/// `MessageAlreadyProcessed` never mutate ratchet state, with one
/// documented exception: symmetric-step decryption commits chain
/// advancement before the AEAD open, so a forged ciphertext at a fresh
/// index burns that index and a retry of the same packet reports
/// `MessageAlreadyProcessed`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("wrong role: {0}")]
    WrongRole(&'static str),
    #[error("wrong state: {0}")]
    WrongState(&'static str),
    #[error("handshake identifier mismatch")]
    HandshakeIdMismatch,
    #[error("handshake replay detected within ttl window")]
    HandshakeReplay,
    #[error("unsupported protocol version {0}")]
    VersionUnsupported(u32),
    #[error("handshake signature verification failed")]
    SignatureInvalid,
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("semantic tag mismatch")]
    SemanticTagMismatch,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("message already processed")]
    MessageAlreadyProcessed,
    #[error("session poisoned by an earlier invariant violation")]
    SessionPoisoned,
    #[error("malformed session state: {0}")]
    StateMalformed(String),
    #[error(transparent)]
    Kem(#[from] KemError),
    #[error(transparent)]
    Sign(#[from] SignError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
