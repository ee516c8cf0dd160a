//! Per-peer TCP connection with wire-protocol state.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::handshake::{HANDSHAKE_LEN, HandshakeCodec};
use super::messages::MessageCodec;
use super::types::{PeerHandshake, PeerId, PeerMessage};
use crate::torrent::{InfoHash, PieceIndex, TorrentError};

/// Wire-protocol state tracked per connected peer.
///
/// Both directions start choked and not interested.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// We are choking the peer
    pub am_choking: bool,
    /// We are interested in the peer's pieces
    pub am_interested: bool,
    /// The peer is choking us
    pub peer_choking: bool,
    /// The peer is interested in our pieces
    pub peer_interested: bool,
    /// Pieces the peer reports having
    pub have_set: HashSet<PieceIndex>,
    /// Block ranges the peer has requested from us, grouped by piece
    pub requested_by_peer: HashMap<PieceIndex, Vec<(u32, u32)>>,
    /// When we last sent anything (drives keep-alives)
    pub last_sent: Instant,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            have_set: HashSet::new(),
            requested_by_peer: HashMap::new(),
            last_sent: Instant::now(),
        }
    }

    /// Distinct pieces with at least one outstanding request from the peer.
    pub fn requested_pieces(&self) -> Vec<PieceIndex> {
        let mut pieces: Vec<PieceIndex> = self.requested_by_peer.keys().copied().collect();
        pieces.sort();
        pieces
    }
}

/// A handshaken connection to one peer.
///
/// State is privately owned by the connection; transport failure at any
/// point discards it, there is no implicit reconnection.
#[derive(Debug)]
pub struct PeerConnection {
    stream: TcpStream,
    address: SocketAddr,
    remote_peer_id: PeerId,
    state: ConnectionState,
}

impl PeerConnection {
    /// Connects out to a peer and performs the handshake exchange.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the TCP connection,
    ///   handshake I/O, or info-hash validation failed
    pub async fn connect(
        address: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        connect_timeout: Duration,
    ) -> Result<Self, TorrentError> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) | Err(_) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("failed to connect to {address}"),
                });
            }
        };
        let mut connection = Self {
            stream,
            address,
            remote_peer_id: PeerId::new([0u8; 20]),
            state: ConnectionState::new(),
        };

        let handshake = PeerHandshake::new(info_hash, peer_id);
        connection
            .write_all(&HandshakeCodec::encode(&handshake))
            .await?;

        let remote = connection.read_handshake().await?;
        if remote.info_hash != info_hash {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("info-hash mismatch in handshake from {address}"),
            });
        }
        connection.remote_peer_id = remote.peer_id;

        tracing::debug!("Connected to peer {address}");
        Ok(connection)
    }

    /// Accepts an inbound connection: reads the peer's handshake, validates
    /// its info-hash against the loaded set, and replies.
    ///
    /// Returns the connection together with the torrent it belongs to.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If handshake I/O failed or the
    ///   info-hash is not loaded
    pub async fn accept(
        stream: TcpStream,
        address: SocketAddr,
        peer_id: PeerId,
        loaded: &[InfoHash],
    ) -> Result<(Self, InfoHash), TorrentError> {
        let mut connection = Self {
            stream,
            address,
            remote_peer_id: PeerId::new([0u8; 20]),
            state: ConnectionState::new(),
        };

        let remote = connection.read_handshake().await?;
        if !loaded.contains(&remote.info_hash) {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("handshake from {address} for an unloaded torrent"),
            });
        }
        connection.remote_peer_id = remote.peer_id;

        let reply = PeerHandshake::new(remote.info_hash, peer_id);
        connection.write_all(&HandshakeCodec::encode(&reply)).await?;

        tracing::debug!("Accepted peer {address}");
        Ok((connection, remote.info_hash))
    }

    /// Returns the peer's socket address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns the peer id received in the handshake.
    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    /// Returns the connection state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Returns the connection state mutably.
    pub fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    /// Sends one wire message.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the write failed
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        let encoded = MessageCodec::encode(message);
        self.write_all(&encoded).await?;
        self.state.last_sent = Instant::now();
        Ok(())
    }

    /// Receives the next wire message, waiting as long as it takes.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the connection closed or a
    ///   read failed
    /// - `TorrentError::ProtocolViolation` - If the frame is malformed
    pub async fn receive(&mut self) -> Result<PeerMessage, TorrentError> {
        let mut length_buf = [0u8; 4];
        self.read_exact(&mut length_buf).await?;

        let length = u32::from_be_bytes(length_buf);
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        let mut payload = vec![0u8; length as usize];
        self.read_exact(&mut payload).await?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&length_buf);
        frame.extend_from_slice(&payload);
        MessageCodec::decode(&frame)
    }

    /// Bounded receive: waits up to `wait` for a frame header to become
    /// readable, then reads the message. Returns `None` when nothing
    /// complete arrived within the window.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the connection closed or a
    ///   read failed
    /// - `TorrentError::ProtocolViolation` - If the frame is malformed
    pub async fn poll_receive(
        &mut self,
        wait: Duration,
    ) -> Result<Option<PeerMessage>, TorrentError> {
        let mut header = [0u8; 4];
        // Peek keeps the framing intact if the window elapses mid-header.
        match tokio::time::timeout(wait, self.stream.peek(&mut header)).await {
            Err(_) => Ok(None),
            Ok(Err(error)) => Err(TorrentError::PeerConnectionError {
                reason: format!("peek from {} failed: {error}", self.address),
            }),
            Ok(Ok(0)) => Err(TorrentError::PeerConnectionError {
                reason: format!("peer {} closed the connection", self.address),
            }),
            Ok(Ok(n)) if n < 4 => Ok(None),
            Ok(Ok(_)) => self.receive().await.map(Some),
        }
    }

    /// Applies a received message to the connection state.
    ///
    /// Interest re-evaluation needs the torrent's have table and stays with
    /// the caller; everything self-contained lands here.
    pub fn apply(&mut self, message: &PeerMessage) {
        match message {
            PeerMessage::Choke => self.state.peer_choking = true,
            PeerMessage::Unchoke => self.state.peer_choking = false,
            PeerMessage::Interested => self.state.peer_interested = true,
            PeerMessage::NotInterested => self.state.peer_interested = false,
            PeerMessage::Have { piece_index } => {
                self.state.have_set.insert(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                self.state.have_set = MessageCodec::flags_from_bitfield(bitfield)
                    .into_iter()
                    .collect();
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                // Requests arriving while we choke the peer are ignored.
                if !self.state.am_choking {
                    self.state
                        .requested_by_peer
                        .entry(*piece_index)
                        .or_default()
                        .push((*offset, *length));
                }
            }
            PeerMessage::KeepAlive | PeerMessage::Piece { .. } => {}
        }
    }

    /// Returns whether a keep-alive is due.
    pub fn needs_keepalive(&self, interval: Duration) -> bool {
        self.state.last_sent.elapsed() >= interval
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TorrentError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|error| TorrentError::PeerConnectionError {
                reason: format!("write to {} failed: {error}", self.address),
            })
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TorrentError> {
        self.stream
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|error| TorrentError::PeerConnectionError {
                reason: format!("read from {} failed: {error}", self.address),
            })
    }

    async fn read_handshake(&mut self) -> Result<PeerHandshake, TorrentError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        self.read_exact(&mut buf).await?;
        HandshakeCodec::decode(&buf)
    }
}
