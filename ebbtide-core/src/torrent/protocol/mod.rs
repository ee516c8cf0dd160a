//! BitTorrent peer wire protocol: handshake, message framing and per-peer
//! connection state.

pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;

pub use connection::{ConnectionState, PeerConnection};
pub use handshake::{HANDSHAKE_LEN, HandshakeCodec};
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage};
