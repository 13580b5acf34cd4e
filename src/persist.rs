//! Durable session state: versioned export/import.
//!
//! Two encodings of the same record:
//! - binary (production): CBOR, raw byte strings, never starts with
//!   `0x7B`;
//! - textual (debug): JSON with lowercase-hex values, always starts
//!   with `0x7B` (`{`).
//!
//! `import` dispatches on the first byte. Readers reject unknown
//! schema versions.

use serde::{Deserialize, Serialize};

use crate::crypto::aead::NONCE_LEN;
use crate::crypto::kdf::{LABEL_A_TO_B, LABEL_B_TO_A};
use crate::crypto::pqc::KemKeypair;
use crate::error::{Result, SessionError};
use crate::protocol::strategy::RatchetMode;
use crate::ratchet::{RatchetState, SkippedKey};
use crate::session::{Role, Session};

/// Current persisted-state schema.
pub const STATE_SCHEMA_VERSION: u32 = 1;

const JSON_FIRST_BYTE: u8 = 0x7B;

#[derive(Serialize, Deserialize)]
struct BinarySkipped {
    index: u64,
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    nonce: Vec<u8>,
}

/// CBOR mirror of the session state, raw bytes throughout.
#[derive(Serialize, Deserialize)]
struct BinaryRecord {
    schema: u32,
    is_initiator: bool,
    #[serde(with = "serde_bytes")]
    semantic_hint: Vec<u8>,
    #[serde(with = "serde_bytes")]
    root_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    send_chain_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    recv_chain_key: Vec<u8>,
    send_label: String,
    recv_label: String,
    send_count: u64,
    recv_count: u64,
    #[serde(with = "serde_bytes")]
    local_ratchet_private: Vec<u8>,
    #[serde(with = "serde_bytes")]
    local_ratchet_public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    remote_ratchet_public: Option<Vec<u8>>,
    #[serde(with = "serde_bytes")]
    combined_digest: Vec<u8>,
    #[serde(with = "serde_bytes")]
    local_digest: Vec<u8>,
    #[serde(with = "serde_bytes")]
    remote_digest: Option<Vec<u8>>,
    skipped_keys: Vec<BinarySkipped>,
    max_skip: u64,
    mode: String,
}

/// JSON mirror; every byte field is a lowercase-hex string.
#[derive(Serialize, Deserialize)]
struct TextRecord {
    schema: u32,
    is_initiator: bool,
    semantic_hint: String,
    root_key: String,
    send_chain_key: String,
    recv_chain_key: String,
    send_label: String,
    recv_label: String,
    send_count: u64,
    recv_count: u64,
    local_ratchet_private: String,
    local_ratchet_public: String,
    remote_ratchet_public: Option<String>,
    combined_digest: String,
    local_digest: String,
    remote_digest: Option<String>,
    skipped_keys: Vec<(u64, String, String)>,
    max_skip: u64,
    mode: String,
}

fn label_str(label: &'static [u8]) -> &'static str {
    if label == LABEL_A_TO_B {
        "CHAIN|A2B"
    } else {
        "CHAIN|B2A"
    }
}

fn parse_label(s: &str) -> Result<&'static [u8]> {
    match s {
        "CHAIN|A2B" => Ok(LABEL_A_TO_B),
        "CHAIN|B2A" => Ok(LABEL_B_TO_A),
        other => Err(SessionError::StateMalformed(format!(
            "unknown chain label {other:?}"
        ))),
    }
}

fn array_32(bytes: Vec<u8>, field: &str) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| SessionError::StateMalformed(format!("{field} must be 32 bytes")))
}

fn array_nonce(bytes: Vec<u8>) -> Result<[u8; NONCE_LEN]> {
    bytes
        .try_into()
        .map_err(|_| SessionError::StateMalformed("skipped nonce must be 16 bytes".into()))
}

fn unhex(s: &str, field: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|_| SessionError::StateMalformed(format!("{field} is not valid hex")))
}

fn binary_record(session: &Session) -> Result<BinaryRecord> {
    let state = session
        .ratchet
        .as_ref()
        .ok_or(SessionError::WrongState("session not ready"))?;

    Ok(BinaryRecord {
        schema: STATE_SCHEMA_VERSION,
        is_initiator: session.role() == Role::Initiator,
        semantic_hint: session.semantic_hint.clone(),
        root_key: state.root_key.to_vec(),
        send_chain_key: state.send_chain_key.to_vec(),
        recv_chain_key: state.recv_chain_key.to_vec(),
        send_label: label_str(state.send_label).to_string(),
        recv_label: label_str(state.recv_label).to_string(),
        send_count: state.send_count,
        recv_count: state.recv_count,
        local_ratchet_private: state.local_ratchet.secret.clone(),
        local_ratchet_public: state.local_ratchet.public.clone(),
        remote_ratchet_public: state.remote_ratchet_public.clone(),
        combined_digest: state.combined_digest.to_vec(),
        local_digest: state.local_digest.to_vec(),
        remote_digest: state.remote_digest.map(|d| d.to_vec()),
        skipped_keys: state
            .skipped
            .iter()
            .map(|(&index, entry)| BinarySkipped {
                index,
                key: entry.message_key.to_vec(),
                nonce: entry.nonce.to_vec(),
            })
            .collect(),
        max_skip: state.max_skip as u64,
        mode: session.strategy.mode().as_str().to_string(),
    })
}

fn text_record(record: &BinaryRecord) -> TextRecord {
    TextRecord {
        schema: record.schema,
        is_initiator: record.is_initiator,
        semantic_hint: hex::encode(&record.semantic_hint),
        root_key: hex::encode(&record.root_key),
        send_chain_key: hex::encode(&record.send_chain_key),
        recv_chain_key: hex::encode(&record.recv_chain_key),
        send_label: record.send_label.clone(),
        recv_label: record.recv_label.clone(),
        send_count: record.send_count,
        recv_count: record.recv_count,
        local_ratchet_private: hex::encode(&record.local_ratchet_private),
        local_ratchet_public: hex::encode(&record.local_ratchet_public),
        remote_ratchet_public: record.remote_ratchet_public.as_ref().map(hex::encode),
        combined_digest: hex::encode(&record.combined_digest),
        local_digest: hex::encode(&record.local_digest),
        remote_digest: record.remote_digest.as_ref().map(hex::encode),
        skipped_keys: record
            .skipped_keys
            .iter()
            .map(|entry| (entry.index, hex::encode(&entry.key), hex::encode(&entry.nonce)))
            .collect(),
        max_skip: record.max_skip,
        mode: record.mode.clone(),
    }
}

fn record_from_text(text: TextRecord) -> Result<BinaryRecord> {
    Ok(BinaryRecord {
        schema: text.schema,
        is_initiator: text.is_initiator,
        semantic_hint: unhex(&text.semantic_hint, "semantic_hint")?,
        root_key: unhex(&text.root_key, "root_key")?,
        send_chain_key: unhex(&text.send_chain_key, "send_chain_key")?,
        recv_chain_key: unhex(&text.recv_chain_key, "recv_chain_key")?,
        send_label: text.send_label,
        recv_label: text.recv_label,
        send_count: text.send_count,
        recv_count: text.recv_count,
        local_ratchet_private: unhex(&text.local_ratchet_private, "local_ratchet_private")?,
        local_ratchet_public: unhex(&text.local_ratchet_public, "local_ratchet_public")?,
        remote_ratchet_public: text
            .remote_ratchet_public
            .map(|s| unhex(&s, "remote_ratchet_public"))
            .transpose()?,
        combined_digest: unhex(&text.combined_digest, "combined_digest")?,
        local_digest: unhex(&text.local_digest, "local_digest")?,
        remote_digest: text
            .remote_digest
            .map(|s| unhex(&s, "remote_digest"))
            .transpose()?,
        skipped_keys: text
            .skipped_keys
            .into_iter()
            .map(|(index, key, nonce)| {
                Ok(BinarySkipped {
                    index,
                    key: unhex(&key, "skipped key")?,
                    nonce: unhex(&nonce, "skipped nonce")?,
                })
            })
            .collect::<Result<_>>()?,
        max_skip: text.max_skip,
        mode: text.mode,
    })
}

fn session_from_record(record: BinaryRecord) -> Result<Session> {
    if record.schema != STATE_SCHEMA_VERSION {
        return Err(SessionError::StateMalformed(format!(
            "unknown state schema {}",
            record.schema
        )));
    }

    let send_label = parse_label(&record.send_label)?;
    let recv_label = parse_label(&record.recv_label)?;
    if send_label == recv_label {
        return Err(SessionError::StateMalformed(
            "send and receive labels must differ".into(),
        ));
    }
    let expected_send = if record.is_initiator {
        LABEL_A_TO_B
    } else {
        LABEL_B_TO_A
    };
    if send_label != expected_send {
        return Err(SessionError::StateMalformed(
            "chain labels inconsistent with role".into(),
        ));
    }

    let mode: RatchetMode = record
        .mode
        .parse()
        .map_err(|_| SessionError::StateMalformed(format!("unknown mode {:?}", record.mode)))?;

    let max_skip = record.max_skip as usize;
    if max_skip == 0 {
        return Err(SessionError::StateMalformed("max_skip must be >= 1".into()));
    }

    let mut skipped = std::collections::BTreeMap::new();
    for entry in record.skipped_keys {
        skipped.insert(
            entry.index,
            SkippedKey {
                message_key: array_32(entry.key, "skipped key")?,
                nonce: array_nonce(entry.nonce)?,
            },
        );
    }
    if skipped.len() > max_skip {
        return Err(SessionError::StateMalformed(
            "skipped cache exceeds max_skip".into(),
        ));
    }

    let state = RatchetState {
        root_key: array_32(record.root_key, "root_key")?,
        send_chain_key: array_32(record.send_chain_key, "send_chain_key")?,
        recv_chain_key: array_32(record.recv_chain_key, "recv_chain_key")?,
        send_label,
        recv_label,
        send_count: record.send_count,
        recv_count: record.recv_count,
        local_ratchet: KemKeypair {
            public: record.local_ratchet_public,
            secret: record.local_ratchet_private,
        },
        remote_ratchet_public: record.remote_ratchet_public,
        combined_digest: array_32(record.combined_digest, "combined_digest")?,
        local_digest: array_32(record.local_digest, "local_digest")?,
        remote_digest: record
            .remote_digest
            .map(|d| array_32(d, "remote_digest"))
            .transpose()?,
        skipped,
        max_skip,
    };

    let role = if record.is_initiator {
        Role::Initiator
    } else {
        Role::Responder
    };
    Ok(Session::restore(
        role,
        record.semantic_hint,
        max_skip,
        mode,
        state,
    ))
}

/// Serialize a ready session.
pub(crate) fn export(session: &Session, binary: bool) -> Result<Vec<u8>> {
    let record = binary_record(session)?;
    if binary {
        let mut out = Vec::new();
        ciborium::ser::into_writer(&record, &mut out)
            .map_err(|e| SessionError::StateMalformed(e.to_string()))?;
        debug_assert_ne!(out.first(), Some(&JSON_FIRST_BYTE));
        Ok(out)
    } else {
        serde_json::to_vec(&text_record(&record))
            .map_err(|e| SessionError::StateMalformed(e.to_string()))
    }
}

/// Restore a session from either serialized form (one-byte sniff).
pub(crate) fn import(blob: &[u8]) -> Result<Session> {
    let record = match blob.first() {
        None => {
            return Err(SessionError::StateMalformed("empty state blob".into()));
        }
        Some(&JSON_FIRST_BYTE) => {
            let text: TextRecord = serde_json::from_slice(blob)
                .map_err(|e| SessionError::StateMalformed(e.to_string()))?;
            record_from_text(text)?
        }
        Some(_) => ciborium::de::from_reader(blob)
            .map_err(|e| SessionError::StateMalformed(e.to_string()))?,
    };
    session_from_record(record)
}
