//! Double-ratchet state and the encrypt/decrypt engine.
//!
//! The root chain is driven by ML-KEM encapsulations ("pulses"); each
//! direction has a symmetric chain advanced one SHA-256 step per
//! message. Message counters are absolute for the session lifetime:
//! a pulse re-seeds both chains from the new root and derivation
//! continues at the sender's current counter, so replays from any
//! earlier epoch always carry a stale counter.
//!
//! Out-of-order messages are served from a bounded skipped-key cache.
//! The cache is bound to its chain epoch and cleared on every pulse;
//! late messages from before a pulse fail as already-processed.

use std::collections::BTreeMap;

use zeroize::Zeroize;

use crate::crypto::aead::{self, NONCE_LEN};
use crate::crypto::constant_time::eq_16;
use crate::crypto::kdf::{
    self, derive_chain_seed, derive_message_material, semantic_tag, LABEL_A_TO_B, LABEL_B_TO_A,
};
use crate::crypto::pqc::{self, KemKeypair};
use crate::error::{Result, SessionError};
use crate::protocol::handshake::PROTOCOL_VERSION;
use crate::protocol::packet::{Packet, PacketHeader};
use crate::protocol::strategy::PulseStrategy;

/// Default bound for the skipped-message key cache.
pub const MAX_SKIP_DEFAULT: usize = 50;

/// Pre-derived material for a message that has not arrived yet.
pub(crate) struct SkippedKey {
    pub(crate) message_key: [u8; 32],
    pub(crate) nonce: [u8; NONCE_LEN],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
        self.nonce.zeroize();
    }
}

/// Full double-ratchet state for one session.
pub struct RatchetState {
    pub(crate) root_key: [u8; 32],
    pub(crate) send_chain_key: [u8; 32],
    pub(crate) recv_chain_key: [u8; 32],
    pub(crate) send_label: &'static [u8],
    pub(crate) recv_label: &'static [u8],
    pub(crate) send_count: u64,
    pub(crate) recv_count: u64,
    pub(crate) local_ratchet: KemKeypair,
    pub(crate) remote_ratchet_public: Option<Vec<u8>>,
    pub(crate) combined_digest: [u8; 32],
    pub(crate) local_digest: [u8; 32],
    pub(crate) remote_digest: Option<[u8; 32]>,
    pub(crate) skipped: BTreeMap<u64, SkippedKey>,
    pub(crate) max_skip: usize,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
    }
}

impl RatchetState {
    /// Derive the initial state from the handshake shared secret.
    ///
    /// The initiator sends on the A→B chain and receives on B→A; the
    /// responder is mirrored, so cross-paired chains match.
    pub(crate) fn bootstrap(
        shared_secret: &[u8; 32],
        combined_digest: [u8; 32],
        local_digest: [u8; 32],
        remote_digest: [u8; 32],
        is_initiator: bool,
        local_ratchet: KemKeypair,
        remote_ratchet_public: Vec<u8>,
        max_skip: usize,
    ) -> Self {
        let root_key = kdf::mix_root(None, shared_secret, &combined_digest);
        let (send_label, recv_label) = if is_initiator {
            (LABEL_A_TO_B, LABEL_B_TO_A)
        } else {
            (LABEL_B_TO_A, LABEL_A_TO_B)
        };

        Self {
            send_chain_key: derive_chain_seed(&root_key, &combined_digest, send_label),
            recv_chain_key: derive_chain_seed(&root_key, &combined_digest, recv_label),
            root_key,
            send_label,
            recv_label,
            send_count: 0,
            recv_count: 0,
            local_ratchet,
            remote_ratchet_public: Some(remote_ratchet_public),
            combined_digest,
            local_digest,
            remote_digest: Some(remote_digest),
            skipped: BTreeMap::new(),
            max_skip: max_skip.max(1),
        }
    }

    /// Mix a pulse shared secret into the root and re-seed both chains.
    fn apply_pulse(&mut self, shared_secret: &[u8; 32]) {
        let new_root = kdf::mix_root(Some(&self.root_key), shared_secret, &self.combined_digest);
        self.root_key.zeroize();
        self.root_key = new_root;

        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        self.send_chain_key =
            derive_chain_seed(&self.root_key, &self.combined_digest, self.send_label);
        self.recv_chain_key =
            derive_chain_seed(&self.root_key, &self.combined_digest, self.recv_label);

        // Skipped keys belong to the retired chain epoch.
        self.skipped.clear();
    }

    fn store_skipped(&mut self, index: u64, message_key: [u8; 32], nonce: [u8; NONCE_LEN]) {
        if self.skipped.len() >= self.max_skip {
            self.skipped.pop_first();
        }
        self.skipped.insert(
            index,
            SkippedKey {
                message_key,
                nonce,
            },
        );
    }

    fn aad_binding(associated_data: &[u8], header: &PacketHeader) -> Vec<u8> {
        let header_bytes = header.encode();
        let mut aad = Vec::with_capacity(associated_data.len() + header_bytes.len());
        aad.extend_from_slice(associated_data);
        aad.extend_from_slice(&header_bytes);
        aad
    }

    /// Encrypt a message, pulsing the KEM when the strategy asks for it.
    pub(crate) fn encrypt(
        &mut self,
        strategy: &mut PulseStrategy,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Packet> {
        let remote = self
            .remote_ratchet_public
            .clone()
            .ok_or(SessionError::WrongState("remote ratchet key missing"))?;

        let do_pulse = strategy.should_pulse(plaintext.len());
        let (ratchet_pub, kem_ciphertext) = if do_pulse {
            let (kem_ct, shared_secret) = pqc::encapsulate(&remote)?;
            self.apply_pulse(&shared_secret);

            // Rotate our keypair; the retired secret zeroizes on drop.
            let fresh = pqc::generate_keypair()?;
            self.local_ratchet = fresh;
            log::debug!("kem pulse emitted at count {}", self.send_count);

            (self.local_ratchet.public.clone(), kem_ct)
        } else {
            (Vec::new(), Vec::new())
        };

        let (mut message_key, next_chain, nonce) =
            derive_message_material(&self.send_chain_key, self.send_count);
        self.send_chain_key.zeroize();
        self.send_chain_key = next_chain;

        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            count: self.send_count,
            ratchet_pub,
            kem_ciphertext,
            semantic_tag: semantic_tag(&self.combined_digest, self.send_count),
        };

        let aad = Self::aad_binding(associated_data, &header);
        let ciphertext = aead::seal(&message_key, &nonce, &aad, plaintext)?;
        message_key.zeroize();

        self.send_count += 1;
        if do_pulse {
            strategy.note_pulse();
        } else {
            strategy.note_send(plaintext.len());
        }

        Ok(Packet { header, ciphertext })
    }

    /// Decrypt a packet.
    ///
    /// The semantic tag is checked in constant time before any state
    /// is touched. Symmetric-step decryption commits chain advancement
    /// before the AEAD open (see [`SessionError`]); skipped-cache hits
    /// only consume their entry after a successful open.
    pub(crate) fn decrypt(
        &mut self,
        strategy: &mut PulseStrategy,
        packet: &Packet,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let header = &packet.header;
        if header.version != PROTOCOL_VERSION {
            return Err(SessionError::VersionUnsupported(header.version));
        }

        let index = header.count;
        let expected_tag = semantic_tag(&self.combined_digest, index);
        if !eq_16(&expected_tag, &header.semantic_tag) {
            return Err(SessionError::SemanticTagMismatch);
        }

        let aad = Self::aad_binding(associated_data, header);

        if header.is_pulse() {
            if header.ratchet_pub.is_empty() {
                return Err(SessionError::MalformedPacket("pulse without ratchet key"));
            }
            // A replayed (or stale) pulse must not touch the root.
            if index < self.recv_count {
                return Err(SessionError::MessageAlreadyProcessed);
            }

            let shared_secret =
                pqc::decapsulate(&header.kem_ciphertext, &self.local_ratchet.secret)?;
            self.apply_pulse(&shared_secret);
            self.remote_ratchet_public = Some(header.ratchet_pub.clone());
            self.recv_count = index;
            strategy.note_pulse();
            log::debug!("kem pulse applied at count {index}");

            let (mut message_key, next_chain, nonce) =
                derive_message_material(&self.recv_chain_key, index);
            self.recv_chain_key.zeroize();
            self.recv_chain_key = next_chain;
            self.recv_count = index + 1;

            let plaintext = aead::open(&message_key, &nonce, &aad, &packet.ciphertext);
            message_key.zeroize();
            return plaintext;
        }

        if index < self.recv_count {
            // Late arrival: serve from the skipped cache without
            // consuming the entry until the open succeeds.
            let (mut message_key, nonce) = match self.skipped.get(&index) {
                Some(entry) => (entry.message_key, entry.nonce),
                None => return Err(SessionError::MessageAlreadyProcessed),
            };
            let plaintext = aead::open(&message_key, &nonce, &aad, &packet.ciphertext);
            message_key.zeroize();
            let plaintext = plaintext?;
            self.skipped.remove(&index);
            return Ok(plaintext);
        }

        // Advance the chain up to the packet index, caching skipped
        // material along the way (bounded, oldest index evicted).
        while self.recv_count < index {
            let (message_key, next_chain, nonce) =
                derive_message_material(&self.recv_chain_key, self.recv_count);
            self.store_skipped(self.recv_count, message_key, nonce);
            self.recv_chain_key.zeroize();
            self.recv_chain_key = next_chain;
            self.recv_count += 1;
        }

        let (mut message_key, next_chain, nonce) =
            derive_message_material(&self.recv_chain_key, index);
        self.recv_chain_key.zeroize();
        self.recv_chain_key = next_chain;
        self.recv_count = index + 1;

        let plaintext = aead::open(&message_key, &nonce, &aad, &packet.ciphertext);
        message_key.zeroize();
        plaintext
    }

    pub(crate) fn skipped_len(&self) -> usize {
        self.skipped.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::strategy::RatchetMode;

    /// Build a cross-paired state pair the way the handshake would.
    fn paired(max_skip: usize) -> (RatchetState, RatchetState, PulseStrategy, PulseStrategy) {
        let alice_digest = kdf::semantic_digest(b"alice");
        let bob_digest = kdf::semantic_digest(b"bob");
        let combined = kdf::combined_digest(&alice_digest, &bob_digest);

        let alice_kp = pqc::generate_keypair().unwrap();
        let bob_kp = pqc::generate_keypair().unwrap();
        let shared = [0x5Au8; 32];

        let alice = RatchetState::bootstrap(
            &shared,
            combined,
            alice_digest,
            bob_digest,
            true,
            alice_kp.clone(),
            bob_kp.public.clone(),
            max_skip,
        );
        let bob = RatchetState::bootstrap(
            &shared,
            combined,
            bob_digest,
            alice_digest,
            false,
            bob_kp,
            alice_kp.public.clone(),
            max_skip,
        );
        (
            alice,
            bob,
            PulseStrategy::new(RatchetMode::BalancedFlow),
            PulseStrategy::new(RatchetMode::BalancedFlow),
        )
    }

    #[test]
    fn test_chains_cross_pair_after_bootstrap() {
        let (alice, bob, _, _) = paired(10);
        assert_eq!(alice.root_key, bob.root_key);
        assert_eq!(alice.combined_digest, bob.combined_digest);
        assert_eq!(alice.send_chain_key, bob.recv_chain_key);
        assert_eq!(alice.recv_chain_key, bob.send_chain_key);
    }

    #[test]
    fn test_symmetric_round_trip() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let packet = alice.encrypt(&mut sa, b"hello pq", b"").unwrap();
        assert!(!packet.header.is_pulse());
        assert_eq!(bob.decrypt(&mut sb, &packet, b"").unwrap(), b"hello pq");

        let reply = bob.encrypt(&mut sb, b"roger", b"").unwrap();
        assert_eq!(alice.decrypt(&mut sa, &reply, b"").unwrap(), b"roger");
    }

    #[test]
    fn test_associated_data_is_bound() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let packet = alice.encrypt(&mut sa, b"payload", b"channel-7").unwrap();
        assert!(matches!(
            bob.decrypt(&mut sb, &packet, b"channel-8"),
            Err(SessionError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_pulse_round_trip_and_rotation() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);
        let mut max_sec = PulseStrategy::new(RatchetMode::MaximumSecurity);

        let before = alice.local_ratchet.public.clone();
        let packet = alice.encrypt(&mut max_sec, b"pulsed", b"").unwrap();
        assert!(packet.header.is_pulse());
        assert_ne!(alice.local_ratchet.public, before);

        assert_eq!(bob.decrypt(&mut sb, &packet, b"").unwrap(), b"pulsed");
        assert_eq!(alice.root_key, bob.root_key);
        assert_eq!(
            bob.remote_ratchet_public.as_deref(),
            Some(alice.local_ratchet.public.as_slice())
        );

        // Conversation continues symmetrically on the new epoch.
        let next = alice.encrypt(&mut sa, b"after pulse", b"").unwrap();
        assert!(!next.header.is_pulse());
        assert_eq!(bob.decrypt(&mut sb, &next, b"").unwrap(), b"after pulse");
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let packets: Vec<Packet> = (0..5)
            .map(|i| {
                alice
                    .encrypt(&mut sa, format!("msg-{i}").as_bytes(), b"")
                    .unwrap()
            })
            .collect();

        for i in (0..5usize).rev() {
            let plaintext = bob.decrypt(&mut sb, &packets[i], b"").unwrap();
            assert_eq!(plaintext, format!("msg-{i}").as_bytes());
        }
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let packet = alice.encrypt(&mut sa, b"once", b"").unwrap();
        bob.decrypt(&mut sb, &packet, b"").unwrap();
        assert!(matches!(
            bob.decrypt(&mut sb, &packet, b""),
            Err(SessionError::MessageAlreadyProcessed)
        ));
    }

    #[test]
    fn test_skip_cache_eviction_is_oldest_index() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(5);

        let packets: Vec<Packet> = (0..10)
            .map(|i| {
                alice
                    .encrypt(&mut sa, format!("msg-{i}").as_bytes(), b"")
                    .unwrap()
            })
            .collect();

        // Deliver 6..9 first: indices 0..=5 get derived, cache holds 5.
        for packet in &packets[6..] {
            bob.decrypt(&mut sb, packet, b"").unwrap();
        }
        assert_eq!(bob.skipped_len(), 5);

        // Index 0 was evicted (oldest), 1..=5 remain.
        assert!(matches!(
            bob.decrypt(&mut sb, &packets[0], b""),
            Err(SessionError::MessageAlreadyProcessed)
        ));
        assert_eq!(bob.decrypt(&mut sb, &packets[1], b"").unwrap(), b"msg-1");
    }

    #[test]
    fn test_semantic_tag_mismatch_does_not_advance() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let mut packet = alice.encrypt(&mut sa, b"msg", b"").unwrap();
        packet.header.count = 9999;
        assert!(matches!(
            bob.decrypt(&mut sb, &packet, b""),
            Err(SessionError::SemanticTagMismatch)
        ));
        assert_eq!(bob.recv_count, 0);

        packet.header.count = 0;
        assert_eq!(bob.decrypt(&mut sb, &packet, b"").unwrap(), b"msg");
    }

    #[test]
    fn test_tampered_ciphertext_burns_index() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let mut packet = alice.encrypt(&mut sa, b"msg", b"").unwrap();
        *packet.ciphertext.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            bob.decrypt(&mut sb, &packet, b""),
            Err(SessionError::AuthenticationFailed)
        ));

        // Chain advanced before the open; the honest retry now reports
        // the index as consumed.
        *packet.ciphertext.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            bob.decrypt(&mut sb, &packet, b""),
            Err(SessionError::MessageAlreadyProcessed)
        ));
    }

    #[test]
    fn test_skipped_entry_survives_failed_open() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let p0 = alice.encrypt(&mut sa, b"msg-0", b"").unwrap();
        let p1 = alice.encrypt(&mut sa, b"msg-1", b"").unwrap();
        bob.decrypt(&mut sb, &p1, b"").unwrap();

        let mut tampered = p0.clone();
        *tampered.ciphertext.last_mut().unwrap() ^= 0x01;
        assert!(matches!(
            bob.decrypt(&mut sb, &tampered, b""),
            Err(SessionError::AuthenticationFailed)
        ));

        // The probe did not consume the cached key.
        assert_eq!(bob.decrypt(&mut sb, &p0, b"").unwrap(), b"msg-0");
    }

    #[test]
    fn test_old_snapshot_cannot_read_past_pulse() {
        let (mut alice, mut bob, mut sa, mut sb) = paired(10);

        let packet = alice.encrypt(&mut sa, b"before", b"").unwrap();
        bob.decrypt(&mut sb, &packet, b"").unwrap();

        // Snapshot bob's chain view, then pulse alice → bob.
        let old_recv_chain = bob.recv_chain_key;
        let old_recv_count = bob.recv_count;

        let mut max_sec = PulseStrategy::new(RatchetMode::MaximumSecurity);
        let pulse = alice.encrypt(&mut max_sec, b"rotate", b"").unwrap();
        bob.decrypt(&mut sb, &pulse, b"").unwrap();

        let post = alice.encrypt(&mut sa, b"fresh secret", b"").unwrap();

        // A state frozen before the pulse derives garbage for the new
        // epoch.
        let (mut stale_key, _, stale_nonce) =
            derive_message_material(&old_recv_chain, post.header.count);
        let _ = old_recv_count;
        let aad = RatchetState::aad_binding(b"", &post.header);
        assert!(aead::open(&stale_key, &stale_nonce, &aad, &post.ciphertext).is_err());
        stale_key.zeroize();

        // The live state reads it fine.
        assert_eq!(bob.decrypt(&mut sb, &post, b"").unwrap(), b"fresh secret");
    }

    #[test]
    fn test_replayed_pulse_rejected_without_root_damage() {
        let (mut alice, mut bob, _, mut sb) = paired(10);
        let mut max_sec = PulseStrategy::new(RatchetMode::MaximumSecurity);

        let pulse = alice.encrypt(&mut max_sec, b"rotate", b"").unwrap();
        bob.decrypt(&mut sb, &pulse, b"").unwrap();
        let root_after = bob.root_key;

        assert!(matches!(
            bob.decrypt(&mut sb, &pulse, b""),
            Err(SessionError::MessageAlreadyProcessed)
        ));
        assert_eq!(bob.root_key, root_after);
    }
}
