pub mod handshake;
pub mod packet;
pub mod replay;
pub mod strategy;

pub use handshake::{HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION};
pub use packet::{pack_packet, unpack_packet, Packet, PacketHeader};
pub use strategy::{PulseStrategy, RatchetMode};
