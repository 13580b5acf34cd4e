//! # pulse-ratchet
//!
//! A post-quantum, forward-secret double-ratchet session library.
//!
//! Two peers agree on a shared key through an ML-KEM-768 handshake
//! authenticated with ML-DSA signatures, then exchange AEAD-protected
//! packets. A root chain is refreshed by adaptive KEM "pulses" for
//! post-compromise security; per-direction symmetric chains provide
//! forward secrecy per message. The crate is embeddable: no transport
//! and no I/O. Packets go in and out as self-describing byte blobs,
//! and session state can be exported and resumed.
//!
//! ```no_run
//! use pulse_ratchet::Session;
//!
//! let mut alice = Session::create_initiator(b"alice".to_vec());
//! let mut bob = Session::create_responder(b"bob".to_vec());
//!
//! let request = alice.create_handshake_request()?;
//! let response = bob.accept_handshake(&request)?;
//! alice.finalize_handshake(&response)?;
//!
//! let packet = alice.encrypt(b"hello pq", b"")?;
//! assert_eq!(bob.decrypt(&packet, b"")?, b"hello pq");
//! # Ok::<(), pulse_ratchet::SessionError>(())
//! ```

pub mod crypto;
pub mod error;
pub mod persist;
pub mod protocol;
pub mod ratchet;
pub mod session;

pub use error::SessionError;
pub use persist::STATE_SCHEMA_VERSION;
pub use protocol::handshake::{HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION};
pub use protocol::packet::{pack_packet, unpack_packet, Packet, PacketHeader};
pub use protocol::replay;
pub use protocol::strategy::{PulseStrategy, RatchetMode};
pub use ratchet::MAX_SKIP_DEFAULT;
pub use session::{Role, Session, SessionConfig};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
