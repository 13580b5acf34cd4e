//! Handshake messages: request, response, canonical signing bytes and
//! wire codecs.
//!
//! Signatures cover the canonical length-prefixed encoding of every
//! field preceding the signature, so a verifier rebuilds the exact
//! byte string from the parsed message. All integers are big-endian.

use crate::crypto::signing;
use crate::error::{Result, SessionError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest version this implementation accepts.
pub const MIN_SUPPORTED_VERSION: u32 = 1;
/// Newest version this implementation accepts.
pub const MAX_SUPPORTED_VERSION: u32 = 1;

/// Handshake id length: 12 random bytes plus 4 bytes of big-endian
/// Unix seconds.
pub const HANDSHAKE_ID_LEN: usize = 16;

const MSG_TYPE_REQUEST: u8 = 0x01;
const MSG_TYPE_RESPONSE: u8 = 0x02;

/// Bound for KEM/ratchet public key fields (matches the packet codec).
const MAX_PUBLIC_KEY: usize = 8 * 1024;
/// Bound for KEM ciphertext fields.
const MAX_KEM_CT: usize = 16 * 1024;
/// Bound for signature public keys (ML-DSA-87 needs 2592).
const MAX_SIG_PUBLIC: usize = 4 * 1024;
/// Bound for detached signatures (ML-DSA-87 needs 4627).
const MAX_SIGNATURE: usize = 8 * 1024;

/// Initiator → responder handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: u32,
    pub min_version: u32,
    pub max_version: u32,
    pub handshake_id: [u8; HANDSHAKE_ID_LEN],
    pub kem_public: Vec<u8>,
    pub ratchet_public: Vec<u8>,
    pub semantic_digest: [u8; 32],
    pub signature_public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Responder → initiator handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub version: u32,
    pub handshake_id: [u8; HANDSHAKE_ID_LEN],
    pub kem_ciphertext: Vec<u8>,
    pub ratchet_public: Vec<u8>,
    pub semantic_digest: [u8; 32],
    pub signature_public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

fn put_bytes(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

impl HandshakeRequest {
    /// Canonical pre-signature encoding.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            12 + HANDSHAKE_ID_LEN
                + 32
                + self.kem_public.len()
                + self.ratchet_public.len()
                + self.signature_public_key.len()
                + 12,
        );
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.min_version.to_be_bytes());
        out.extend_from_slice(&self.max_version.to_be_bytes());
        out.extend_from_slice(&self.handshake_id);
        put_bytes(&mut out, &self.kem_public);
        put_bytes(&mut out, &self.ratchet_public);
        out.extend_from_slice(&self.semantic_digest);
        put_bytes(&mut out, &self.signature_public_key);
        out
    }

    /// Verify the embedded signature against the canonical encoding.
    pub fn verify_signature(&self) -> Result<()> {
        let ok = signing::verify(
            &self.signing_bytes(),
            &self.signature,
            &self.signature_public_key,
        )
        .map_err(|_| SessionError::SignatureInvalid)?;
        if ok {
            Ok(())
        } else {
            Err(SessionError::SignatureInvalid)
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.signing_bytes().len() + 4 + self.signature.len());
        out.push(MSG_TYPE_REQUEST);
        out.extend_from_slice(&self.signing_bytes());
        put_bytes(&mut out, &self.signature);
        out
    }

    /// Parse from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(data);
        if r.u8()? != MSG_TYPE_REQUEST {
            return Err(SessionError::MalformedPacket("not a handshake request"));
        }

        let version = r.u32()?;
        if version != PROTOCOL_VERSION {
            return Err(SessionError::VersionUnsupported(version));
        }
        let min_version = r.u32()?;
        let max_version = r.u32()?;
        let handshake_id = r.array::<HANDSHAKE_ID_LEN>()?;
        let kem_public = r.bytes(MAX_PUBLIC_KEY, "kem public key too long")?;
        let ratchet_public = r.bytes(MAX_PUBLIC_KEY, "ratchet public key too long")?;
        let semantic_digest = r.array::<32>()?;
        let signature_public_key = r.bytes(MAX_SIG_PUBLIC, "signature public key too long")?;
        let signature = r.bytes(MAX_SIGNATURE, "signature too long")?;
        r.finish()?;

        Ok(Self {
            version,
            min_version,
            max_version,
            handshake_id,
            kem_public,
            ratchet_public,
            semantic_digest,
            signature_public_key,
            signature,
        })
    }
}

impl HandshakeResponse {
    /// Canonical pre-signature encoding.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + HANDSHAKE_ID_LEN
                + 32
                + self.kem_ciphertext.len()
                + self.ratchet_public.len()
                + self.signature_public_key.len()
                + 12,
        );
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.handshake_id);
        put_bytes(&mut out, &self.kem_ciphertext);
        put_bytes(&mut out, &self.ratchet_public);
        out.extend_from_slice(&self.semantic_digest);
        put_bytes(&mut out, &self.signature_public_key);
        out
    }

    /// Verify the embedded signature against the canonical encoding.
    pub fn verify_signature(&self) -> Result<()> {
        let ok = signing::verify(
            &self.signing_bytes(),
            &self.signature,
            &self.signature_public_key,
        )
        .map_err(|_| SessionError::SignatureInvalid)?;
        if ok {
            Ok(())
        } else {
            Err(SessionError::SignatureInvalid)
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.signing_bytes().len() + 4 + self.signature.len());
        out.push(MSG_TYPE_RESPONSE);
        out.extend_from_slice(&self.signing_bytes());
        put_bytes(&mut out, &self.signature);
        out
    }

    /// Parse from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(data);
        if r.u8()? != MSG_TYPE_RESPONSE {
            return Err(SessionError::MalformedPacket("not a handshake response"));
        }

        let version = r.u32()?;
        if version != PROTOCOL_VERSION {
            return Err(SessionError::VersionUnsupported(version));
        }
        let handshake_id = r.array::<HANDSHAKE_ID_LEN>()?;
        let kem_ciphertext = r.bytes(MAX_KEM_CT, "kem ciphertext too long")?;
        let ratchet_public = r.bytes(MAX_PUBLIC_KEY, "ratchet public key too long")?;
        let semantic_digest = r.array::<32>()?;
        let signature_public_key = r.bytes(MAX_SIG_PUBLIC, "signature public key too long")?;
        let signature = r.bytes(MAX_SIGNATURE, "signature too long")?;
        r.finish()?;

        Ok(Self {
            version,
            handshake_id,
            kem_ciphertext,
            ratchet_public,
            semantic_digest,
            signature_public_key,
            signature,
        })
    }
}

/// Reject requests whose advertised version window misses ours.
pub fn check_version_overlap(min_version: u32, max_version: u32) -> Result<()> {
    if min_version > max_version
        || max_version < MIN_SUPPORTED_VERSION
        || min_version > MAX_SUPPORTED_VERSION
    {
        return Err(SessionError::VersionUnsupported(max_version));
    }
    Ok(())
}

struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(SessionError::MalformedPacket("truncated handshake message"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn bytes(&mut self, bound: usize, label: &'static str) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > bound {
            return Err(SessionError::MalformedPacket(label));
        }
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(SessionError::MalformedPacket("trailing bytes"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing;

    fn signed_request() -> HandshakeRequest {
        let keys = signing::generate_keypair();
        let mut request = HandshakeRequest {
            version: PROTOCOL_VERSION,
            min_version: MIN_SUPPORTED_VERSION,
            max_version: MAX_SUPPORTED_VERSION,
            handshake_id: [0x21; HANDSHAKE_ID_LEN],
            kem_public: vec![0x01; 1184],
            ratchet_public: vec![0x02; 1184],
            semantic_digest: [0x03; 32],
            signature_public_key: keys.public.clone(),
            signature: Vec::new(),
        };
        request.signature = signing::sign(&request.signing_bytes(), &keys.secret).unwrap();
        request
    }

    #[test]
    fn test_request_signature_round_trip() {
        let request = signed_request();
        request.verify_signature().unwrap();
    }

    #[test]
    fn test_request_signature_covers_fields() {
        let mut request = signed_request();
        request.handshake_id[0] ^= 1;
        assert!(matches!(
            request.verify_signature(),
            Err(SessionError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_request_codec_round_trip() {
        let request = signed_request();
        let wire = request.encode();
        let back = HandshakeRequest::decode(&wire).unwrap();
        assert_eq!(back, request);
        back.verify_signature().unwrap();
    }

    #[test]
    fn test_response_codec_round_trip() {
        let keys = signing::generate_keypair();
        let mut response = HandshakeResponse {
            version: PROTOCOL_VERSION,
            handshake_id: [0x42; HANDSHAKE_ID_LEN],
            kem_ciphertext: vec![0x05; 1088],
            ratchet_public: vec![0x06; 1184],
            semantic_digest: [0x07; 32],
            signature_public_key: keys.public.clone(),
            signature: Vec::new(),
        };
        response.signature = signing::sign(&response.signing_bytes(), &keys.secret).unwrap();

        let back = HandshakeResponse::decode(&response.encode()).unwrap();
        assert_eq!(back, response);
        back.verify_signature().unwrap();
    }

    #[test]
    fn test_version_overlap() {
        check_version_overlap(1, 1).unwrap();
        check_version_overlap(1, 7).unwrap();
        assert!(check_version_overlap(2, 7).is_err());
        assert!(check_version_overlap(3, 2).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_type_octet() {
        let wire = signed_request().encode();
        let mut swapped = wire.clone();
        swapped[0] = 0x02;
        assert!(HandshakeRequest::decode(&swapped).is_err());
    }
}
