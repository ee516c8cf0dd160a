//! Wire message framing for the BitTorrent peer protocol.

use bytes::{Buf, BufMut, Bytes};

use super::types::PeerMessage;
use crate::torrent::{PieceIndex, TorrentError};

/// Message codec for BEP 3 framing.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a peer message, length prefix included.
    pub fn encode(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // 1 + 4
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // 1 + 4 + 4 + 4
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // 1 + 4 + 4 + data
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
        }

        buf
    }

    /// Deserializes a complete frame (length prefix included).
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolViolation` - If the frame is truncated,
    ///   carries a wrong payload length, or uses an unrecognized message id
    pub fn decode(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(violation("message too short"));
        }

        let mut buf = data;
        let length = buf.get_u32();

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if data.len() < 4 + length as usize {
            return Err(violation("incomplete message frame"));
        }

        let message_id = buf.get_u8();
        match message_id {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                if length != 5 {
                    return Err(violation("invalid have message length"));
                }
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                })
            }
            5 => {
                let bitfield_len = (length - 1) as usize;
                Ok(PeerMessage::Bitfield {
                    bitfield: Bytes::copy_from_slice(&buf[..bitfield_len]),
                })
            }
            6 => {
                if length != 13 {
                    return Err(violation("invalid request message length"));
                }
                Ok(PeerMessage::Request {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            7 => {
                if length < 9 {
                    return Err(violation("invalid piece message length"));
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let data_len = (length - 9) as usize;
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(&buf[..data_len]),
                })
            }
            other => Err(violation(format!("unrecognized message id: {other}"))),
        }
    }

    /// Builds a bitfield payload from per-piece flags, MSB-first within each
    /// byte.
    pub fn bitfield_from_flags(flags: &[bool]) -> Bytes {
        let mut bytes = vec![0u8; flags.len().div_ceil(8)];
        for (index, held) in flags.iter().enumerate() {
            if *held {
                bytes[index / 8] |= 0x80 >> (index % 8);
            }
        }
        Bytes::from(bytes)
    }

    /// Expands a bitfield payload into set piece indices, MSB-first.
    pub fn flags_from_bitfield(bitfield: &[u8]) -> Vec<PieceIndex> {
        let mut pieces = Vec::new();
        for (byte_index, byte) in bitfield.iter().enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    pieces.push(PieceIndex::new((byte_index * 8 + bit) as u32));
                }
            }
        }
        pieces
    }
}

fn violation(message: impl Into<String>) -> TorrentError {
    TorrentError::ProtocolViolation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(MessageCodec::encode(&PeerMessage::KeepAlive), vec![0, 0, 0, 0]);
        assert_eq!(
            MessageCodec::decode(&[0, 0, 0, 0]).unwrap(),
            PeerMessage::KeepAlive
        );
    }

    #[test]
    fn test_flag_messages_round_trip() {
        for message in [
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
        ] {
            let encoded = MessageCodec::encode(&message);
            assert_eq!(MessageCodec::decode(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn test_have_round_trip() {
        let message = PeerMessage::Have {
            piece_index: PieceIndex::new(1234),
        };
        let encoded = MessageCodec::encode(&message);
        assert_eq!(encoded[..5], [0, 0, 0, 5, 4]);
        assert_eq!(MessageCodec::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_request_round_trip() {
        let message = PeerMessage::Request {
            piece_index: PieceIndex::new(7),
            offset: 16_384,
            length: 16_384,
        };
        let encoded = MessageCodec::encode(&message);
        assert_eq!(encoded[..5], [0, 0, 0, 13, 6]);
        assert_eq!(MessageCodec::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_piece_round_trip() {
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(3),
            offset: 0,
            data: Bytes::from_static(b"block data"),
        };
        let encoded = MessageCodec::encode(&message);
        assert_eq!(MessageCodec::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_bitfield_round_trip() {
        let message = PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b1010_0000, 0b0000_0001]),
        };
        let encoded = MessageCodec::encode(&message);
        assert_eq!(MessageCodec::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_unrecognized_ids_are_violations() {
        // Cancel (8) and Port (9) are outside this engine's recognized set,
        // as is anything higher.
        for id in [8u8, 9, 20, 255] {
            let frame = [0, 0, 0, 1, id];
            assert!(matches!(
                MessageCodec::decode(&frame),
                Err(TorrentError::ProtocolViolation { .. })
            ));
        }
    }

    #[test]
    fn test_truncated_frames_are_violations() {
        assert!(matches!(
            MessageCodec::decode(&[0, 0]),
            Err(TorrentError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            MessageCodec::decode(&[0, 0, 0, 5, 4, 0]),
            Err(TorrentError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_wrong_payload_length_is_violation() {
        // Have with a 2-byte payload.
        assert!(matches!(
            MessageCodec::decode(&[0, 0, 0, 3, 4, 0, 0]),
            Err(TorrentError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_bitfield_msb_first() {
        let flags = [true, false, false, false, false, false, false, false, true];
        let bitfield = MessageCodec::bitfield_from_flags(&flags);
        assert_eq!(&bitfield[..], &[0b1000_0000, 0b1000_0000]);

        let pieces = MessageCodec::flags_from_bitfield(&bitfield);
        assert_eq!(pieces, vec![PieceIndex::new(0), PieceIndex::new(8)]);
    }
}
