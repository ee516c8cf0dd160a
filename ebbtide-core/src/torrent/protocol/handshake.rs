//! BitTorrent handshake serialization and validation.

use super::types::{PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Wire size of a handshake message.
pub const HANDSHAKE_LEN: usize = 68;

const PROTOCOL_LITERAL: &[u8; 19] = b"BitTorrent protocol";

/// Handshake codec for the fixed 68-byte exchange.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes a handshake following BEP 3.
    pub fn encode(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_LITERAL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_LITERAL);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes and validates a 68-byte handshake.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the buffer is not a
    ///   well-formed BitTorrent handshake
    pub fn decode(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("handshake must be {HANDSHAKE_LEN} bytes, got {}", data.len()),
            });
        }
        if data[0] as usize != PROTOCOL_LITERAL.len() || &data[1..20] != PROTOCOL_LITERAL {
            return Err(TorrentError::PeerConnectionError {
                reason: "unknown handshake protocol identifier".to_string(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}
