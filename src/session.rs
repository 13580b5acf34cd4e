//! High-level session: handshake state machine plus messaging.
//!
//! A session is single-threaded with respect to its state; callers
//! serialize concurrent use. No operation performs I/O.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::constant_time::eq_16;
use crate::crypto::kdf;
use crate::crypto::pqc::{self, KemKeypair};
use crate::crypto::signing;
use crate::error::{Result, SessionError};
use crate::protocol::handshake::{
    check_version_overlap, HandshakeRequest, HandshakeResponse, HANDSHAKE_ID_LEN,
    MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION,
};
use crate::protocol::packet::{pack_packet, unpack_packet, Packet};
use crate::protocol::replay;
use crate::protocol::strategy::{PulseStrategy, RatchetMode};
use crate::ratchet::{RatchetState, MAX_SKIP_DEFAULT};

/// Which side of the handshake this session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Fresh,
    Pending,
    Active,
    Failed,
}

/// Session construction parameters.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Opaque byte string identifying the local endpoint to itself.
    pub semantic_hint: Vec<u8>,
    /// Bound for the out-of-order message key cache (>= 1).
    pub max_skip: usize,
    /// Pulse scheduling mode.
    pub mode: RatchetMode,
}

impl SessionConfig {
    pub fn new(semantic_hint: impl Into<Vec<u8>>) -> Self {
        Self {
            semantic_hint: semantic_hint.into(),
            max_skip: MAX_SKIP_DEFAULT,
            mode: RatchetMode::default(),
        }
    }

    pub fn max_skip(mut self, max_skip: usize) -> Self {
        self.max_skip = max_skip.max(1);
        self
    }

    pub fn mode(mut self, mode: RatchetMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Key material held between request creation and finalization.
struct PendingHandshake {
    handshake_id: [u8; HANDSHAKE_ID_LEN],
    kem: KemKeypair,
    ratchet: KemKeypair,
}

/// A forward-secret messaging session between two peers.
pub struct Session {
    role: Role,
    pub(crate) state: State,
    pub(crate) semantic_hint: Vec<u8>,
    pub(crate) local_digest: [u8; 32],
    pub(crate) max_skip: usize,
    pub(crate) strategy: PulseStrategy,
    pub(crate) ratchet: Option<RatchetState>,
    pending: Option<PendingHandshake>,
    handshake_id: Option<[u8; HANDSHAKE_ID_LEN]>,
}

/// 12 random bytes followed by 4 bytes of big-endian Unix seconds.
fn new_handshake_id() -> [u8; HANDSHAKE_ID_LEN] {
    let mut id = [0u8; HANDSHAKE_ID_LEN];
    OsRng.fill_bytes(&mut id[..12]);
    let seconds = replay::unix_seconds() as u32;
    id[12..].copy_from_slice(&seconds.to_be_bytes());
    id
}

impl Session {
    pub fn with_config(role: Role, config: SessionConfig) -> Self {
        let local_digest = kdf::semantic_digest(&config.semantic_hint);
        Self {
            role,
            state: State::Fresh,
            semantic_hint: config.semantic_hint,
            local_digest,
            max_skip: config.max_skip.max(1),
            strategy: PulseStrategy::new(config.mode),
            ratchet: None,
            pending: None,
            handshake_id: None,
        }
    }

    /// Create an initiator session with default configuration.
    pub fn create_initiator(semantic_hint: impl Into<Vec<u8>>) -> Self {
        Self::with_config(Role::Initiator, SessionConfig::new(semantic_hint))
    }

    /// Create a responder session with default configuration.
    pub fn create_responder(semantic_hint: impl Into<Vec<u8>>) -> Self {
        Self::with_config(Role::Responder, SessionConfig::new(semantic_hint))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Id of the completed (or pending) handshake, if any.
    pub fn handshake_id(&self) -> Option<[u8; HANDSHAKE_ID_LEN]> {
        self.handshake_id
    }

    /// A session is ready iff the handshake finalized and nothing has
    /// failed since.
    pub fn is_ready(&self) -> bool {
        self.state == State::Active && self.ratchet.is_some()
    }

    fn guard_not_poisoned(&self) -> Result<()> {
        if self.state == State::Failed {
            Err(SessionError::SessionPoisoned)
        } else {
            Ok(())
        }
    }

    /// Internal invariant violations poison the session permanently.
    fn poison<T>(&mut self, err: SessionError) -> Result<T> {
        log::warn!("session poisoned: {err}");
        self.state = State::Failed;
        Err(SessionError::SessionPoisoned)
    }

    // ── Handshake ───────────────────────────────────────────────

    /// Initiator, `Fresh` only: produce a signed handshake request.
    pub fn create_handshake_request(&mut self) -> Result<HandshakeRequest> {
        self.guard_not_poisoned()?;
        if self.role != Role::Initiator {
            return Err(SessionError::WrongRole(
                "only initiators can create handshake requests",
            ));
        }
        match self.state {
            State::Active => return Err(SessionError::WrongState("handshake already completed")),
            State::Pending => return Err(SessionError::WrongState("handshake already pending")),
            _ => {}
        }

        let kem = pqc::generate_keypair()?;
        let ratchet = pqc::generate_keypair()?;
        let signer = signing::generate_keypair();
        let handshake_id = new_handshake_id();

        let mut request = HandshakeRequest {
            version: PROTOCOL_VERSION,
            min_version: MIN_SUPPORTED_VERSION,
            max_version: MAX_SUPPORTED_VERSION,
            handshake_id,
            kem_public: kem.public.clone(),
            ratchet_public: ratchet.public.clone(),
            semantic_digest: self.local_digest,
            signature_public_key: signer.public.clone(),
            signature: Vec::new(),
        };
        request.signature = signing::sign(&request.signing_bytes(), &signer.secret)?;

        self.pending = Some(PendingHandshake {
            handshake_id,
            kem,
            ratchet,
        });
        self.handshake_id = Some(handshake_id);
        self.state = State::Pending;
        Ok(request)
    }

    /// Responder, `Fresh` only: validate a request and produce the
    /// signed response, moving straight to `Active`.
    pub fn accept_handshake(&mut self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        self.guard_not_poisoned()?;
        if self.role != Role::Responder {
            return Err(SessionError::WrongRole(
                "only responders can accept handshake requests",
            ));
        }
        if self.state != State::Fresh {
            return Err(SessionError::WrongState("handshake already completed"));
        }

        if request.version != PROTOCOL_VERSION {
            return Err(SessionError::VersionUnsupported(request.version));
        }
        check_version_overlap(request.min_version, request.max_version)?;
        replay::register_handshake_id(&request.handshake_id)?;
        request.verify_signature()?;

        let (kem_ciphertext, shared_secret) = pqc::encapsulate(&request.kem_public)?;
        let combined = kdf::combined_digest(&self.local_digest, &request.semantic_digest);
        let local_ratchet = pqc::generate_keypair()?;
        let ratchet_public = local_ratchet.public.clone();

        self.ratchet = Some(RatchetState::bootstrap(
            &shared_secret,
            combined,
            self.local_digest,
            request.semantic_digest,
            false,
            local_ratchet,
            request.ratchet_public.clone(),
            self.max_skip,
        ));

        let signer = signing::generate_keypair();
        let mut response = HandshakeResponse {
            version: PROTOCOL_VERSION,
            handshake_id: request.handshake_id,
            kem_ciphertext,
            ratchet_public,
            semantic_digest: self.local_digest,
            signature_public_key: signer.public.clone(),
            signature: Vec::new(),
        };
        response.signature = signing::sign(&response.signing_bytes(), &signer.secret)?;

        self.handshake_id = Some(request.handshake_id);
        self.strategy.note_pulse();
        self.state = State::Active;
        Ok(response)
    }

    /// Initiator, `Pending` only: consume the response and activate.
    pub fn finalize_handshake(&mut self, response: &HandshakeResponse) -> Result<()> {
        self.guard_not_poisoned()?;
        if self.role != Role::Initiator {
            return Err(SessionError::WrongRole(
                "only initiators can finalize handshakes",
            ));
        }
        match self.state {
            State::Active => return Err(SessionError::WrongState("handshake already completed")),
            State::Fresh => return Err(SessionError::WrongState("no pending handshake")),
            _ => {}
        }
        let pending = self
            .pending
            .as_ref()
            .ok_or(SessionError::WrongState("no pending handshake"))?;

        if !eq_16(&pending.handshake_id, &response.handshake_id) {
            return Err(SessionError::HandshakeIdMismatch);
        }
        if response.version != PROTOCOL_VERSION {
            return Err(SessionError::VersionUnsupported(response.version));
        }
        response.verify_signature()?;

        let shared_secret = pqc::decapsulate(&response.kem_ciphertext, &pending.kem.secret)?;
        let combined = kdf::combined_digest(&self.local_digest, &response.semantic_digest);

        self.ratchet = Some(RatchetState::bootstrap(
            &shared_secret,
            combined,
            self.local_digest,
            response.semantic_digest,
            true,
            pending.ratchet.clone(),
            response.ratchet_public.clone(),
            self.max_skip,
        ));

        self.handshake_id = Some(response.handshake_id);
        self.pending = None;
        self.strategy.note_pulse();
        self.state = State::Active;
        Ok(())
    }

    // ── Messaging ───────────────────────────────────────────────

    /// Encrypt a message. Pass an empty slice when there is no
    /// associated data.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<Packet> {
        self.guard_not_poisoned()?;
        if self.state != State::Active {
            return Err(SessionError::WrongState("session not ready"));
        }
        let ratchet = self
            .ratchet
            .as_mut()
            .ok_or(SessionError::WrongState("session not ready"))?;
        match ratchet.encrypt(&mut self.strategy, plaintext, associated_data) {
            Err(err @ SessionError::Kem(_)) => self.poison(err),
            other => other,
        }
    }

    /// Decrypt a packet produced by the peer.
    pub fn decrypt(&mut self, packet: &Packet, associated_data: &[u8]) -> Result<Vec<u8>> {
        self.guard_not_poisoned()?;
        if self.state != State::Active {
            return Err(SessionError::WrongState("session not ready"));
        }
        let ratchet = self
            .ratchet
            .as_mut()
            .ok_or(SessionError::WrongState("session not ready"))?;
        match ratchet.decrypt(&mut self.strategy, packet, associated_data) {
            Err(err @ SessionError::Kem(_)) => self.poison(err),
            other => other,
        }
    }

    // ── Wire helpers ────────────────────────────────────────────

    pub fn pack_packet(&self, packet: &Packet) -> Vec<u8> {
        pack_packet(packet)
    }

    pub fn unpack_packet(&self, data: &[u8]) -> Result<Packet> {
        unpack_packet(data)
    }

    // ── Persistence ─────────────────────────────────────────────

    /// Export the session state. `binary = true` yields the compact
    /// CBOR form (production); `false` the hex/JSON debug form.
    pub fn export_state(&self, binary: bool) -> Result<Vec<u8>> {
        if !self.is_ready() {
            return Err(SessionError::WrongState("session not ready"));
        }
        crate::persist::export(self, binary)
    }

    /// Restore a session from either serialized form (auto-detected).
    pub fn from_serialized(blob: &[u8]) -> Result<Session> {
        crate::persist::import(blob)
    }

    pub(crate) fn restore(
        role: Role,
        semantic_hint: Vec<u8>,
        max_skip: usize,
        mode: RatchetMode,
        ratchet: RatchetState,
    ) -> Self {
        let local_digest = ratchet.local_digest;
        Self {
            role,
            state: State::Active,
            semantic_hint,
            local_digest,
            max_skip,
            strategy: PulseStrategy::new(mode),
            ratchet: Some(ratchet),
            pending: None,
            handshake_id: None,
        }
    }
}
