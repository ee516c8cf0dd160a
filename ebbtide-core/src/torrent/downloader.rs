//! Piece pipeline: block-level download and verification, piece upload, and
//! availability bookkeeping.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::time::Instant;

use super::protocol::{PeerConnection, PeerMessage};
use super::{PieceIndex, TorrentError};

/// Standard 16 KiB (2^14) block size for piece requests.
pub const BLOCK_SIZE: u32 = 16_384;

/// Downloads one piece from a peer, block by block.
///
/// Splits the piece into sequential `block_size` requests (the final block
/// truncated to the remainder), accumulates returned blocks by offset, and
/// verifies the assembled piece against `expected_hash`. Unrelated messages
/// arriving mid-transfer are applied to the connection state.
///
/// # Errors
///
/// - `TorrentError::PeerChoked` - If the peer choked before the piece
///   completed (partial data is discarded)
/// - `TorrentError::PeerConnectionError` - If the peer disconnected or a
///   block request exceeded `block_timeout`
/// - `TorrentError::PieceHashMismatch` - If the assembled piece fails
///   verification; the data is discarded and the piece is not held
pub async fn download_piece(
    connection: &mut PeerConnection,
    piece_index: PieceIndex,
    piece_size: u32,
    expected_hash: &[u8; 20],
    block_size: u32,
    block_timeout: Option<Duration>,
) -> Result<Vec<u8>, TorrentError> {
    if connection.state().peer_choking {
        return Err(TorrentError::PeerChoked {
            address: connection.address().to_string(),
        });
    }

    let mut assembled = vec![0u8; piece_size as usize];
    let mut offset = 0u32;
    while offset < piece_size {
        let length = block_size.min(piece_size - offset);
        connection
            .send(&PeerMessage::Request {
                piece_index,
                offset,
                length,
            })
            .await?;

        wait_for_block(connection, piece_index, offset, length, &mut assembled, block_timeout)
            .await?;
        offset += length;
    }

    if !verify_piece(&assembled, expected_hash) {
        tracing::warn!("Piece {piece_index} failed hash verification, discarding");
        return Err(TorrentError::PieceHashMismatch { index: piece_index });
    }
    tracing::debug!("Piece {piece_index} downloaded and verified ({piece_size} bytes)");
    Ok(assembled)
}

/// Waits for the requested block, folding other traffic into the connection
/// state as it passes by.
async fn wait_for_block(
    connection: &mut PeerConnection,
    piece_index: PieceIndex,
    offset: u32,
    length: u32,
    assembled: &mut [u8],
    block_timeout: Option<Duration>,
) -> Result<(), TorrentError> {
    loop {
        let message = match block_timeout {
            Some(limit) => tokio::time::timeout(limit, connection.receive())
                .await
                .map_err(|_| TorrentError::PeerConnectionError {
                    reason: format!(
                        "block request for piece {piece_index} offset {offset} timed out"
                    ),
                })??,
            None => connection.receive().await?,
        };

        match &message {
            PeerMessage::Choke => {
                connection.apply(&message);
                return Err(TorrentError::PeerChoked {
                    address: connection.address().to_string(),
                });
            }
            PeerMessage::Piece {
                piece_index: index,
                offset: block_offset,
                data,
            } if *index == piece_index => {
                let start = *block_offset as usize;
                let end = start + data.len();
                if end > assembled.len() {
                    return Err(TorrentError::ProtocolViolation {
                        message: format!(
                            "block at offset {block_offset} overruns piece {piece_index}"
                        ),
                    });
                }
                assembled[start..end].copy_from_slice(data);
                if *block_offset == offset && data.len() as u32 == length {
                    return Ok(());
                }
            }
            other => connection.apply(other),
        }
    }
}

/// Uploads a piece the peer has requested.
///
/// Serves every recorded block range for the piece, then keeps answering
/// follow-up requests until `quiet_window` elapses with no further request
/// for this piece. Returns the number of bytes sent.
///
/// # Errors
///
/// - `TorrentError::PeerConnectionError` - If a send or receive failed
pub async fn upload_piece(
    connection: &mut PeerConnection,
    piece_index: PieceIndex,
    piece_bytes: &[u8],
    quiet_window: Duration,
) -> Result<u64, TorrentError> {
    let mut sent = 0u64;
    loop {
        let pending = connection
            .state_mut()
            .requested_by_peer
            .remove(&piece_index)
            .unwrap_or_default();
        for (offset, length) in pending {
            let start = offset as usize;
            let end = piece_bytes.len().min(start + length as usize);
            if start >= end {
                continue;
            }
            connection
                .send(&PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(&piece_bytes[start..end]),
                })
                .await?;
            sent += (end - start) as u64;
        }

        // Completion is quiescence: no further request for this piece
        // within the window.
        let deadline = Instant::now() + quiet_window;
        let mut more_requests = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match connection.poll_receive(deadline - now).await? {
                None => break,
                Some(message) => {
                    let for_this_piece = matches!(
                        &message,
                        PeerMessage::Request { piece_index: index, .. } if *index == piece_index
                    );
                    connection.apply(&message);
                    if for_this_piece && !connection.state().am_choking {
                        more_requests = true;
                        break;
                    }
                }
            }
        }
        if !more_requests {
            tracing::debug!("Piece {piece_index} upload complete ({sent} bytes)");
            return Ok(sent);
        }
    }
}

/// Compares a piece's SHA-1 digest against the metainfo piece table entry.
pub fn verify_piece(data: &[u8], expected_hash: &[u8; 20]) -> bool {
    let digest: [u8; 20] = Sha1::digest(data).into();
    digest == *expected_hash
}

/// Enumerates up to `per_peer` pieces the peer has and we lack, starting at
/// `start_index` and wrapping cyclically through the piece space.
pub fn cyclic_available(
    peer_have: &HashSet<PieceIndex>,
    we_have: &[bool],
    per_peer: usize,
    start_index: u32,
) -> Vec<PieceIndex> {
    let total = we_have.len() as u32;
    if total == 0 || per_peer == 0 {
        return Vec::new();
    }
    let mut pieces = Vec::new();
    for step in 0..total {
        if pieces.len() >= per_peer {
            break;
        }
        let index = PieceIndex::new((start_index + step) % total);
        if !we_have[index.as_u32() as usize] && peer_have.contains(&index) {
            pieces.push(index);
        }
    }
    pieces
}

/// Re-verifies stored content against the piece table.
///
/// `content` is the torrent's concatenated file bytes with gaps zero-filled.
/// Pieces that fail verification are zeroed in place and reported not held.
/// Returns the per-piece held flags.
pub fn recheck_pieces(
    content: &mut [u8],
    piece_length: u32,
    piece_hashes: &[[u8; 20]],
) -> Vec<bool> {
    let mut held = vec![false; piece_hashes.len()];
    for (index, expected_hash) in piece_hashes.iter().enumerate() {
        let start = index * piece_length as usize;
        if start >= content.len() {
            // Content shorter than the piece table; the tail stays not-held.
            continue;
        }
        let end = content.len().min(start + piece_length as usize);
        if verify_piece(&content[start..end], expected_hash) {
            held[index] = true;
        } else {
            content[start..end].fill(0);
        }
    }
    held
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::super::protocol::PeerId;
    use super::super::test_data::sha1_of;
    use super::super::InfoHash;
    use super::*;

    #[test]
    fn test_cyclic_available_wraps_from_start_index() {
        // Three pieces, none held, the peer has {1, 2}: enumeration from
        // index 2 yields [2, 1].
        let peer_have: HashSet<PieceIndex> =
            [PieceIndex::new(1), PieceIndex::new(2)].into_iter().collect();
        let we_have = vec![false, false, false];
        let pieces = cyclic_available(&peer_have, &we_have, 2, 2);
        assert_eq!(pieces, vec![PieceIndex::new(2), PieceIndex::new(1)]);
    }

    #[test]
    fn test_cyclic_available_skips_held_pieces() {
        let peer_have: HashSet<PieceIndex> = (0..4).map(PieceIndex::new).collect();
        let we_have = vec![true, false, true, false];
        let pieces = cyclic_available(&peer_have, &we_have, 4, 0);
        assert_eq!(pieces, vec![PieceIndex::new(1), PieceIndex::new(3)]);
    }

    #[test]
    fn test_cyclic_available_respects_per_peer_cap() {
        let peer_have: HashSet<PieceIndex> = (0..8).map(PieceIndex::new).collect();
        let we_have = vec![false; 8];
        let pieces = cyclic_available(&peer_have, &we_have, 3, 6);
        assert_eq!(
            pieces,
            vec![PieceIndex::new(6), PieceIndex::new(7), PieceIndex::new(0)]
        );
    }

    #[test]
    fn test_verify_piece() {
        let data = b"piece payload";
        assert!(verify_piece(data, &sha1_of(data)));
        assert!(!verify_piece(data, &[0u8; 20]));
    }

    #[test]
    fn test_recheck_zeroes_corrupt_pieces() {
        let good = vec![7u8; 16];
        let bad = vec![9u8; 16];
        let mut content = [good.clone(), bad].concat();
        let hashes = vec![sha1_of(&good), sha1_of(&[1u8; 16])];

        let held = recheck_pieces(&mut content, 16, &hashes);
        assert_eq!(held, vec![true, false]);
        assert_eq!(&content[..16], good.as_slice());
        assert_eq!(&content[16..], &[0u8; 16]);
    }

    #[test]
    fn test_recheck_accepts_truncated_final_piece() {
        let content_src = vec![5u8; 24];
        let mut content = content_src.clone();
        let hashes = vec![sha1_of(&content_src[..16]), sha1_of(&content_src[16..])];
        let held = recheck_pieces(&mut content, 16, &hashes);
        assert_eq!(held, vec![true, true]);
    }

    async fn connected_pair(info_hash: InfoHash) -> (PeerConnection, PeerConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, address) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, address, PeerId::new([0xbb; 20]), &[info_hash])
                .await
                .unwrap()
        });
        let client = PeerConnection::connect(
            listen_addr,
            info_hash,
            PeerId::new([0xaa; 20]),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        let (server, _) = server.await.unwrap();
        (client, server)
    }

    /// Serves block requests for one piece out of `content` until the
    /// connection closes.
    async fn serve_blocks(mut peer: PeerConnection, content: Vec<u8>) {
        while let Ok(message) = peer.receive().await {
            if let PeerMessage::Request {
                piece_index,
                offset,
                length,
            } = message
            {
                let start = offset as usize;
                let end = content.len().min(start + length as usize);
                let response = PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(&content[start..end]),
                };
                if peer.send(&response).await.is_err() {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_download_piece_assembles_and_verifies() {
        let info_hash = InfoHash::new([0x42; 20]);
        let (mut client, server) = connected_pair(info_hash).await;
        client.state_mut().peer_choking = false;

        // 40 bytes with a 16-byte block size: three requests, last truncated.
        let content: Vec<u8> = (0u8..40).collect();
        let expected = sha1_of(&content);
        tokio::spawn(serve_blocks(server, content.clone()));

        let piece = download_piece(
            &mut client,
            PieceIndex::new(0),
            content.len() as u32,
            &expected,
            16,
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert_eq!(piece, content);
    }

    #[tokio::test]
    async fn test_download_piece_hash_mismatch_discards_data() {
        let info_hash = InfoHash::new([0x42; 20]);
        let (mut client, server) = connected_pair(info_hash).await;
        client.state_mut().peer_choking = false;

        let content = vec![1u8; 32];
        tokio::spawn(serve_blocks(server, content));

        let result = download_piece(
            &mut client,
            PieceIndex::new(0),
            32,
            &[0u8; 20], // wrong hash
            16,
            Some(Duration::from_secs(2)),
        )
        .await;
        assert!(matches!(
            result,
            Err(TorrentError::PieceHashMismatch { index }) if index == PieceIndex::new(0)
        ));
    }

    #[tokio::test]
    async fn test_download_piece_fails_on_mid_transfer_choke() {
        let info_hash = InfoHash::new([0x42; 20]);
        let (mut client, mut server) = connected_pair(info_hash).await;
        client.state_mut().peer_choking = false;

        let handle = tokio::spawn(async move {
            // Answer the first request, then choke.
            loop {
                match server.receive().await.unwrap() {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    } => {
                        if offset == 0 {
                            server
                                .send(&PeerMessage::Piece {
                                    piece_index,
                                    offset,
                                    data: Bytes::from(vec![0u8; length as usize]),
                                })
                                .await
                                .unwrap();
                        } else {
                            server.send(&PeerMessage::Choke).await.unwrap();
                            break;
                        }
                    }
                    _ => {}
                }
            }
            server
        });

        let result = download_piece(
            &mut client,
            PieceIndex::new(0),
            32,
            &[0u8; 20],
            16,
            Some(Duration::from_secs(2)),
        )
        .await;
        assert!(matches!(result, Err(TorrentError::PeerChoked { .. })));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_download_piece_fails_when_already_choked() {
        let info_hash = InfoHash::new([0x42; 20]);
        let (mut client, _server) = connected_pair(info_hash).await;

        let result = download_piece(
            &mut client,
            PieceIndex::new(0),
            16,
            &[0u8; 20],
            16,
            None,
        )
        .await;
        assert!(matches!(result, Err(TorrentError::PeerChoked { .. })));
    }

    #[tokio::test]
    async fn test_download_piece_fails_on_disconnect() {
        let info_hash = InfoHash::new([0x42; 20]);
        let (mut client, server) = connected_pair(info_hash).await;
        client.state_mut().peer_choking = false;
        drop(server);

        let result = download_piece(
            &mut client,
            PieceIndex::new(0),
            16,
            &[0u8; 20],
            16,
            Some(Duration::from_secs(2)),
        )
        .await;
        assert!(matches!(
            result,
            Err(TorrentError::PeerConnectionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_piece_serves_recorded_requests() {
        let info_hash = InfoHash::new([0x42; 20]);
        let (mut client, mut server) = connected_pair(info_hash).await;

        let content: Vec<u8> = (0u8..32).collect();
        // The peer asked for both halves while unchoked.
        server.state_mut().am_choking = false;
        server.apply(&PeerMessage::Request {
            piece_index: PieceIndex::new(0),
            offset: 0,
            length: 16,
        });
        server.apply(&PeerMessage::Request {
            piece_index: PieceIndex::new(0),
            offset: 16,
            length: 16,
        });

        let uploader = tokio::spawn(async move {
            let sent = upload_piece(
                &mut server,
                PieceIndex::new(0),
                &content,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
            sent
        });

        let first = client.receive().await.unwrap();
        let second = client.receive().await.unwrap();
        let mut assembled = vec![0u8; 32];
        for message in [first, second] {
            match message {
                PeerMessage::Piece { offset, data, .. } => {
                    assembled[offset as usize..offset as usize + data.len()]
                        .copy_from_slice(&data);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(assembled, (0u8..32).collect::<Vec<u8>>());
        assert_eq!(uploader.await.unwrap(), 32);
    }

    #[tokio::test]
    async fn test_upload_piece_completes_after_quiet_window() {
        let info_hash = InfoHash::new([0x42; 20]);
        let (_client, mut server) = connected_pair(info_hash).await;

        // No recorded requests and a silent peer: completes at the window.
        let sent = upload_piece(
            &mut server,
            PieceIndex::new(0),
            &[0u8; 16],
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(sent, 0);
    }
}
