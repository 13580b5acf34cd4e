//! Message packet wire format.
//!
//! All integers are big-endian. Packet layout:
//!
//! ```text
//! [version: u32][count: u64]
//! [ratchet_pub_len: u16][ratchet_pub]
//! [kem_ct_len: u32][kem_ct]
//! [semantic_tag: 16]
//! [ciphertext_len: u32][ciphertext]
//! ```
//!
//! `ratchet_pub` and `kem_ct` are empty (length 0) unless the packet
//! carries a KEM pulse. Encode and decode are pure functions on byte
//! buffers.

use crate::crypto::kdf::SEMANTIC_TAG_LEN;
use crate::error::{Result, SessionError};
use crate::protocol::handshake::PROTOCOL_VERSION;

/// Upper bound for the ratchet public key field (8 KiB).
pub const MAX_RATCHET_PUB: usize = 8 * 1024;
/// Upper bound for the KEM ciphertext field (16 KiB).
pub const MAX_KEM_CT: usize = 16 * 1024;
/// Upper bound for the message ciphertext (16 MiB).
pub const MAX_CIPHERTEXT: usize = 16 * 1024 * 1024;

/// Per-message header. `ratchet_pub` and `kem_ciphertext` are both
/// non-empty iff the message performed a KEM pulse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u32,
    pub count: u64,
    pub ratchet_pub: Vec<u8>,
    pub kem_ciphertext: Vec<u8>,
    pub semantic_tag: [u8; SEMANTIC_TAG_LEN],
}

impl PacketHeader {
    pub fn is_pulse(&self) -> bool {
        !self.kem_ciphertext.is_empty()
    }

    /// Header encoding used both on the wire and as the AEAD
    /// associated-data suffix.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + 8 + 2 + self.ratchet_pub.len() + 4 + self.kem_ciphertext.len() + SEMANTIC_TAG_LEN,
        );
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&(self.ratchet_pub.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.ratchet_pub);
        out.extend_from_slice(&(self.kem_ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.kem_ciphertext);
        out.extend_from_slice(&self.semantic_tag);
        out
    }
}

/// An encrypted message: header plus AEAD ciphertext (tag included).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub ciphertext: Vec<u8>,
}

/// Serialize a packet to wire bytes.
pub fn pack_packet(packet: &Packet) -> Vec<u8> {
    let mut out = packet.header.encode();
    out.reserve(4 + packet.ciphertext.len());
    out.extend_from_slice(&(packet.ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&packet.ciphertext);
    out
}

/// Bounds-checked cursor over a wire buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(SessionError::MalformedPacket("truncated packet"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(SessionError::MalformedPacket("trailing bytes"))
        }
    }
}

/// Parse a packet from wire bytes.
pub fn unpack_packet(data: &[u8]) -> Result<Packet> {
    let mut r = Reader::new(data);

    let version = r.u32()?;
    if version != PROTOCOL_VERSION {
        return Err(SessionError::VersionUnsupported(version));
    }

    let count = r.u64()?;

    let ratchet_pub_len = r.u16()? as usize;
    if ratchet_pub_len > MAX_RATCHET_PUB {
        return Err(SessionError::MalformedPacket("ratchet public key too long"));
    }
    let ratchet_pub = r.take(ratchet_pub_len)?.to_vec();

    let kem_ct_len = r.u32()? as usize;
    if kem_ct_len > MAX_KEM_CT {
        return Err(SessionError::MalformedPacket("kem ciphertext too long"));
    }
    let kem_ciphertext = r.take(kem_ct_len)?.to_vec();

    let semantic_tag: [u8; SEMANTIC_TAG_LEN] = r.take(SEMANTIC_TAG_LEN)?.try_into().unwrap();

    let ciphertext_len = r.u32()? as usize;
    if ciphertext_len > MAX_CIPHERTEXT {
        return Err(SessionError::MalformedPacket("ciphertext too long"));
    }
    let ciphertext = r.take(ciphertext_len)?.to_vec();

    r.finish()?;

    Ok(Packet {
        header: PacketHeader {
            version,
            count,
            ratchet_pub,
            kem_ciphertext,
            semantic_tag,
        },
        ciphertext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pulse: bool) -> Packet {
        Packet {
            header: PacketHeader {
                version: PROTOCOL_VERSION,
                count: 42,
                ratchet_pub: if pulse { vec![0xAA; 1184] } else { Vec::new() },
                kem_ciphertext: if pulse { vec![0xBB; 1088] } else { Vec::new() },
                semantic_tag: [0xCD; SEMANTIC_TAG_LEN],
            },
            ciphertext: b"ciphertext-with-tag".to_vec(),
        }
    }

    #[test]
    fn test_round_trip_symmetric() {
        let packet = sample(false);
        let wire = pack_packet(&packet);
        assert_eq!(unpack_packet(&wire).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_pulse() {
        let packet = sample(true);
        let wire = pack_packet(&packet);
        let back = unpack_packet(&wire).unwrap();
        assert!(back.header.is_pulse());
        assert_eq!(back, packet);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut wire = pack_packet(&sample(false));
        wire[3] = 9;
        assert!(matches!(
            unpack_packet(&wire),
            Err(SessionError::VersionUnsupported(9))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let wire = pack_packet(&sample(false));
        assert!(matches!(
            unpack_packet(&wire[..wire.len() - 3]),
            Err(SessionError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut wire = pack_packet(&sample(false));
        wire.push(0);
        assert!(matches!(
            unpack_packet(&wire),
            Err(SessionError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_oversized_length_field_rejected() {
        let mut wire = pack_packet(&sample(false));
        // ratchet_pub_len sits right after version + count
        wire[12..14].copy_from_slice(&u16::MAX.to_be_bytes());
        assert!(matches!(
            unpack_packet(&wire),
            Err(SessionError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_header_encode_matches_wire_prefix() {
        let packet = sample(true);
        let wire = pack_packet(&packet);
        let header = packet.header.encode();
        assert_eq!(&wire[..header.len()], header.as_slice());
    }
}
