//! Torrent session facade.
//!
//! `TorrentEngine` owns the per-torrent state (metainfo, announce tiers,
//! peer registry, connections, statistics) and ties the tracker client, the
//! wire protocol and the piece pipeline to the storage collaborator. All
//! operations are async and fail with `UnknownTorrent` when the referenced
//! info-hash is not loaded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};

use super::bencode::BencodeValue;
use super::downloader;
use super::metainfo::{self, Metainfo};
use super::peers::{KnownPeer, PeerRegistry};
use super::protocol::{MessageCodec, PeerConnection, PeerId, PeerMessage};
use super::tracker::{
    AnnounceEvent, AnnounceRequest, ScrapeData, ScrapeOutcome, ScrapeUpdate, TrackerClient,
    Transport, UrlAttempt,
};
use super::{InfoHash, PieceIndex, TorrentError};
use crate::config::EbbtideConfig;
use crate::storage::{ByteStore, Database};

/// Snapshot of one connected peer's wire state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub peer: KnownPeer,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

/// Cumulative per-torrent statistics.
///
/// Counters are monotonic and move only on explicit download/upload
/// completion events; `share_ratio` is derived at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub wasted: u64,
    pub share_ratio: f64,
    pub pieces: u64,
    pub have_pieces: u64,
    pub leech_time: Duration,
    pub seed_time: Duration,
}

impl TorrentStats {
    fn new(pieces: u64, total_length: u64) -> Self {
        Self {
            uploaded: 0,
            downloaded: 0,
            left: total_length,
            wasted: 0,
            share_ratio: 0.0,
            pieces,
            have_pieces: 0,
            leech_time: Duration::ZERO,
            seed_time: Duration::ZERO,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        BencodeValue::dict(vec![
            (b"uploaded".to_vec(), BencodeValue::integer(self.uploaded as i64)),
            (
                b"downloaded".to_vec(),
                BencodeValue::integer(self.downloaded as i64),
            ),
            (b"left".to_vec(), BencodeValue::integer(self.left as i64)),
            (b"wasted".to_vec(), BencodeValue::integer(self.wasted as i64)),
            (b"pieces".to_vec(), BencodeValue::integer(self.pieces as i64)),
            (
                b"have_pieces".to_vec(),
                BencodeValue::integer(self.have_pieces as i64),
            ),
            (
                b"leech_time_ms".to_vec(),
                BencodeValue::integer(self.leech_time.as_millis() as i64),
            ),
            (
                b"seed_time_ms".to_vec(),
                BencodeValue::integer(self.seed_time.as_millis() as i64),
            ),
        ])
        .encode()
    }
}

struct TorrentState {
    metainfo: Metainfo,
    announce_tiers: Vec<Vec<String>>,
    registry: PeerRegistry,
    connections: HashMap<(String, u16), Arc<Mutex<PeerConnection>>>,
    tracker_stats: HashMap<String, ScrapeData>,
    stats: TorrentStats,
    have: Vec<bool>,
    phase_started: Instant,
}

impl TorrentState {
    fn new(metainfo: Metainfo) -> Self {
        let piece_count = metainfo.piece_count() as usize;
        let stats = TorrentStats::new(piece_count as u64, metainfo.total_length);
        let announce_tiers = metainfo.announce_tiers.clone();
        Self {
            metainfo,
            announce_tiers,
            registry: PeerRegistry::new(),
            connections: HashMap::new(),
            tracker_stats: HashMap::new(),
            stats,
            have: vec![false; piece_count],
            phase_started: Instant::now(),
        }
    }

    /// Rolls elapsed wall time into the leech or seed counter, depending on
    /// whether anything is left to download.
    fn roll_time(&mut self) {
        let elapsed = self.phase_started.elapsed();
        if self.stats.left > 0 {
            self.stats.leech_time += elapsed;
        } else {
            self.stats.seed_time += elapsed;
        }
        self.phase_started = Instant::now();
    }

    /// Recomputes `left` and `have_pieces` from the held-piece flags.
    fn recompute_progress(&mut self) {
        let mut held_bytes = 0u64;
        let mut held_pieces = 0u64;
        for (index, held) in self.have.iter().enumerate() {
            if *held {
                held_pieces += 1;
                held_bytes += u64::from(self.metainfo.piece_size(PieceIndex::new(index as u32)));
            }
        }
        self.stats.have_pieces = held_pieces;
        self.stats.left = self.metainfo.total_length - held_bytes;
    }

    fn connection(&self, peer: &KnownPeer) -> Option<Arc<Mutex<PeerConnection>>> {
        self.connections
            .get(&(peer.ip.clone(), peer.port))
            .cloned()
    }
}

/// The BitTorrent client core.
///
/// Generic over the storage and tracker-transport collaborators so tests and
/// embedders can swap either without touching the protocol engine.
pub struct TorrentEngine<S: ByteStore, T: Transport> {
    config: EbbtideConfig,
    database: Database<S>,
    tracker: TrackerClient<T>,
    peer_id: PeerId,
    listen_port: AtomicU16,
    torrents: RwLock<HashMap<InfoHash, TorrentState>>,
    listener: Mutex<Option<TcpListener>>,
}

impl<S: ByteStore, T: Transport> TorrentEngine<S, T> {
    /// Creates an engine over the given collaborators. The peer id is
    /// generated once per instance.
    pub fn new(config: EbbtideConfig, store: S, transport: Arc<T>) -> Self {
        let peer_id = PeerId::generate(&config.torrent);
        let listen_port = AtomicU16::new(*config.network.listen_ports.start());
        Self {
            config,
            database: Database::new(store),
            tracker: TrackerClient::new(transport),
            peer_id,
            listen_port,
            torrents: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Returns this client's peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Returns the port announced to trackers and bound by [`start`].
    ///
    /// [`start`]: TorrentEngine::start
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    /// Loads a metainfo buffer and persists it.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MalformedEncoding` - If the buffer is not a valid
    ///   metainfo file
    /// - `TorrentError::AlreadyLoaded` - If the info-hash is already loaded
    pub async fn load(&self, torrent_bytes: &[u8]) -> Result<InfoHash, TorrentError> {
        let parsed = Metainfo::from_bytes(torrent_bytes)?;
        let info_hash = parsed.info_hash;
        let hash_key = info_hash.to_string();

        let mut torrents = self.torrents.write().await;
        if torrents.contains_key(&info_hash) || self.database.torrent_exists(&hash_key).await? {
            return Err(TorrentError::AlreadyLoaded { info_hash });
        }

        self.database
            .add_torrent(
                &hash_key,
                torrent_bytes,
                &metainfo::encode_announce_tiers(&parsed.announce_tiers),
            )
            .await?;
        torrents.insert(info_hash, TorrentState::new(parsed));

        tracing::info!("Loaded torrent {info_hash}");
        Ok(info_hash)
    }

    /// Unloads a torrent, dropping its connections and tombstoning its
    /// persisted fields.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn unload(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let mut torrents = self.torrents.write().await;
        if torrents.remove(&info_hash).is_none() {
            return Err(TorrentError::UnknownTorrent { info_hash });
        }
        self.database.remove_torrent(&info_hash.to_string()).await?;
        tracing::info!("Unloaded torrent {info_hash}");
        Ok(())
    }

    /// Returns the torrent's current announce tiers.
    ///
    /// The order reflects the most recent STARTED-event shuffle, if any.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn announces(&self, info_hash: InfoHash) -> Result<Vec<Vec<String>>, TorrentError> {
        let torrents = self.torrents.read().await;
        let state = torrents
            .get(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        Ok(state.announce_tiers.clone())
    }

    /// Announces to the torrent's trackers, walking tiers in order until one
    /// responds with an interval.
    ///
    /// A `Started` event first shuffles the tier order and the URLs within
    /// each tier, and persists the new order before any request goes out.
    /// Decoded peers are unioned into the registry; per-URL statistics are
    /// recorded for [`tracker_stats`].
    ///
    /// Returns the tracker's announce interval in seconds.
    ///
    /// [`tracker_stats`]: TorrentEngine::tracker_stats
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    /// - `TorrentError::TrackerUnreachable` - If every URL in every tier
    ///   failed; carries the last tracker-reported failure reason
    pub async fn announce(
        &self,
        info_hash: InfoHash,
        event: AnnounceEvent,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<u32, TorrentError> {
        let hash_key = info_hash.to_string();

        // Shuffle-then-persist happens under the write lock so concurrent
        // STARTED announces cannot interleave their tier updates.
        let tiers = {
            let mut torrents = self.torrents.write().await;
            let state = torrents
                .get_mut(&info_hash)
                .ok_or(TorrentError::UnknownTorrent { info_hash })?;
            if event == AnnounceEvent::Started {
                shuffle_tiers(&mut state.announce_tiers);
                self.database
                    .update_announce_tiers(
                        &hash_key,
                        &metainfo::encode_announce_tiers(&state.announce_tiers),
                    )
                    .await?;
            }
            state.announce_tiers.clone()
        };

        let request = AnnounceRequest {
            info_hash,
            peer_id: self.peer_id,
            port: self.listen_port(),
            uploaded,
            downloaded,
            left,
            event,
        };
        let walk = self.tracker.announce(&tiers, &request).await;

        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;

        for peer in &walk.peers {
            self.database
                .set_peer_validity(&hash_key, &peer.ip, peer.port, true)
                .await?;
        }
        state.registry.insert_all(walk.peers.iter().cloned());
        self.database
            .write_peer_set(&hash_key, &encode_peer_set(&state.registry))
            .await?;

        for (url, attempt) in &walk.attempts {
            let entry = match attempt {
                UrlAttempt::Responded {
                    complete,
                    incomplete,
                } => ScrapeData::apply(
                    state.tracker_stats.get(url),
                    &ScrapeUpdate {
                        complete: *complete,
                        downloaded: None,
                        incomplete: *incomplete,
                        name: None,
                    },
                ),
                UrlAttempt::Failed { reason } => ScrapeData::Failure {
                    reason: reason.clone(),
                },
            };
            self.database
                .write_tracker_stats(&hash_key, url, &entry.to_bytes())
                .await?;
            state.tracker_stats.insert(url.clone(), entry);
        }

        match walk.outcome {
            Some((url, interval)) => {
                tracing::debug!("Announce for {info_hash} answered by {url}: interval {interval}s");
                Ok(interval)
            }
            None => Err(TorrentError::TrackerUnreachable {
                reason: walk
                    .last_failure()
                    .unwrap_or("no tracker could be reached")
                    .to_string(),
            }),
        }
    }

    /// Scrapes every tracker whose URL can be rewritten to a scrape URL and
    /// records the statistics. Unrewritable URLs are skipped.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn scrape(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let tiers = self.announces(info_hash).await?;
        let hash_key = info_hash.to_string();

        let mut outcomes = Vec::new();
        for url in tiers.iter().flatten() {
            if let Some(outcome) = self.tracker.scrape(url, info_hash).await {
                outcomes.push((url.clone(), outcome));
            }
        }

        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        for (url, outcome) in outcomes {
            let entry = match outcome {
                ScrapeOutcome::Stats(update) => {
                    ScrapeData::apply(state.tracker_stats.get(&url), &update)
                }
                ScrapeOutcome::Failure { reason } => ScrapeData::Failure { reason },
                ScrapeOutcome::NoEntry => continue,
            };
            self.database
                .write_tracker_stats(&hash_key, &url, &entry.to_bytes())
                .await?;
            state.tracker_stats.insert(url, entry);
        }
        Ok(())
    }

    /// Invalidates a known peer; a no-op when the peer is unknown or already
    /// invalid.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn invalidate_peer(
        &self,
        info_hash: InfoHash,
        peer: &KnownPeer,
    ) -> Result<(), TorrentError> {
        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        if state.registry.is_valid(peer) {
            state.registry.invalidate(peer);
            self.database
                .set_peer_validity(&info_hash.to_string(), &peer.ip, peer.port, false)
                .await?;
        }
        Ok(())
    }

    /// Returns all valid known peers in ascending numerical order.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn known_peers(&self, info_hash: InfoHash) -> Result<Vec<KnownPeer>, TorrentError> {
        let torrents = self.torrents.read().await;
        let state = torrents
            .get(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        Ok(state.registry.known_peers())
    }

    /// Returns the latest statistics seen per tracker URL. Only trackers
    /// that have been contacted appear.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn tracker_stats(
        &self,
        info_hash: InfoHash,
    ) -> Result<HashMap<String, ScrapeData>, TorrentError> {
        let torrents = self.torrents.read().await;
        let state = torrents
            .get(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        Ok(state.tracker_stats.clone())
    }

    /// Returns the torrent's cumulative statistics.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn torrent_stats(&self, info_hash: InfoHash) -> Result<TorrentStats, TorrentError> {
        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        state.roll_time();
        let mut stats = state.stats.clone();
        stats.share_ratio = if stats.downloaded == 0 {
            0.0
        } else {
            stats.uploaded as f64 / stats.downloaded as f64
        };
        Ok(stats)
    }

    /// Starts listening for inbound peer connections on the first free
    /// configured port.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If already listening or no
    ///   configured port could be bound
    pub async fn start(&self) -> Result<(), TorrentError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Err(TorrentError::PeerConnectionError {
                reason: "listener is already running".to_string(),
            });
        }

        let mut last_error = None;
        for port in self.config.network.listen_ports.clone() {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(bound) => {
                    self.listen_port.store(port, Ordering::SeqCst);
                    *listener = Some(bound);
                    tracing::info!("Listening for peers on port {port}");
                    return Ok(());
                }
                Err(error) => last_error = Some(error),
            }
        }
        Err(TorrentError::PeerConnectionError {
            reason: format!("no listen port could be bound: {last_error:?}"),
        })
    }

    /// Stops listening and disconnects every peer.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the listener is not
    ///   running
    pub async fn stop(&self) -> Result<(), TorrentError> {
        let mut listener = self.listener.lock().await;
        if listener.take().is_none() {
            return Err(TorrentError::PeerConnectionError {
                reason: "listener is not running".to_string(),
            });
        }
        let mut torrents = self.torrents.write().await;
        for state in torrents.values_mut() {
            state.connections.clear();
        }
        tracing::info!("Stopped listening for peers");
        Ok(())
    }

    /// Connects to a known peer and performs the handshake. If any piece is
    /// held, the bitfield is sent right after.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    /// - `TorrentError::PeerConnectionError` - If the peer is unknown, the
    ///   connection failed, or the handshake did not validate
    pub async fn connect(&self, info_hash: InfoHash, peer: &KnownPeer) -> Result<(), TorrentError> {
        let have = {
            let torrents = self.torrents.read().await;
            let state = torrents
                .get(&info_hash)
                .ok_or(TorrentError::UnknownTorrent { info_hash })?;
            if !state.registry.is_valid(peer) {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("peer {}:{} is not known", peer.ip, peer.port),
                });
            }
            state.have.clone()
        };

        let address: SocketAddr = format!("{}:{}", peer.ip, peer.port).parse().map_err(|_| {
            TorrentError::PeerConnectionError {
                reason: format!("invalid peer address {}:{}", peer.ip, peer.port),
            }
        })?;
        let mut connection = PeerConnection::connect(
            address,
            info_hash,
            self.peer_id,
            self.config.network.connect_timeout,
        )
        .await?;

        if have.iter().any(|held| *held) {
            connection
                .send(&PeerMessage::Bitfield {
                    bitfield: MessageCodec::bitfield_from_flags(&have),
                })
                .await?;
        }

        let remote_id = connection.remote_peer_id().as_bytes().to_vec();
        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        state
            .registry
            .record_peer_id(&peer.ip, peer.port, remote_id);
        state.connections.insert(
            (peer.ip.clone(), peer.port),
            Arc::new(Mutex::new(connection)),
        );
        Ok(())
    }

    /// Drops the connection to a peer. No messages are sent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    /// - `TorrentError::PeerConnectionError` - If the peer is not connected
    pub async fn disconnect(
        &self,
        info_hash: InfoHash,
        peer: &KnownPeer,
    ) -> Result<(), TorrentError> {
        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        state
            .connections
            .remove(&(peer.ip.clone(), peer.port))
            .ok_or_else(|| TorrentError::PeerConnectionError {
                reason: format!("peer {}:{} is not connected", peer.ip, peer.port),
            })?;
        Ok(())
    }

    /// Returns a snapshot of the connected peers' wire state.
    ///
    /// Connections busy in a piece transfer are omitted from the snapshot.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn connected_peers(
        &self,
        info_hash: InfoHash,
    ) -> Result<Vec<ConnectedPeer>, TorrentError> {
        let torrents = self.torrents.read().await;
        let state = torrents
            .get(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;

        let mut snapshot = Vec::new();
        for ((ip, port), connection) in &state.connections {
            let Ok(connection) = connection.try_lock() else {
                continue;
            };
            let wire = connection.state();
            let mut peer = KnownPeer::new(ip.clone(), *port);
            peer.peer_id = Some(connection.remote_peer_id().as_bytes().to_vec());
            snapshot.push(ConnectedPeer {
                peer,
                am_choking: wire.am_choking,
                am_interested: wire.am_interested,
                peer_choking: wire.peer_choking,
                peer_interested: wire.peer_interested,
            });
        }
        snapshot.sort_by(|a, b| a.peer.cmp(&b.peer));
        Ok(snapshot)
    }

    /// Chokes a connected peer.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    /// - `TorrentError::PeerConnectionError` - If the peer is not connected
    ///   or the send failed
    pub async fn choke(&self, info_hash: InfoHash, peer: &KnownPeer) -> Result<(), TorrentError> {
        let connection = self.connection_for(info_hash, peer).await?;
        let mut connection = connection.lock().await;
        connection.send(&PeerMessage::Choke).await?;
        connection.state_mut().am_choking = true;
        Ok(())
    }

    /// Unchokes a connected peer.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    /// - `TorrentError::PeerConnectionError` - If the peer is not connected
    ///   or the send failed
    pub async fn unchoke(&self, info_hash: InfoHash, peer: &KnownPeer) -> Result<(), TorrentError> {
        let connection = self.connection_for(info_hash, peer).await?;
        let mut connection = connection.lock().await;
        connection.send(&PeerMessage::Unchoke).await?;
        connection.state_mut().am_choking = false;
        Ok(())
    }

    /// One cooperative dispatch pass: accepts pending inbound handshakes,
    /// drains readable peer messages, re-evaluates interest, and sends due
    /// keep-alives.
    ///
    /// Bounded: waits for incoming data at most on the order of the
    /// configured dispatch window, then returns. Callers invoke this
    /// repeatedly. Connections that fail or violate the protocol are
    /// dropped.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - If persisting a newly accepted peer
    ///   failed
    pub async fn handle_small_messages(&self) -> Result<(), TorrentError> {
        self.accept_pending_peers().await?;
        self.dispatch_connections().await;
        Ok(())
    }

    /// Downloads one piece from a connected peer, verifies it and persists
    /// it.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    /// - `TorrentError::PeerConnectionError` - If the peer is not connected,
    ///   disconnects mid-transfer, or a block request times out
    /// - `TorrentError::PeerChoked` - If the peer choked before the piece
    ///   completed
    /// - `TorrentError::PieceHashMismatch` - If the piece failed
    ///   verification; the bytes are discarded and counted as wasted
    pub async fn request_piece(
        &self,
        info_hash: InfoHash,
        peer: &KnownPeer,
        piece_index: PieceIndex,
    ) -> Result<(), TorrentError> {
        let (connection, piece_size, expected_hash) = {
            let torrents = self.torrents.read().await;
            let state = torrents
                .get(&info_hash)
                .ok_or(TorrentError::UnknownTorrent { info_hash })?;
            let connection = state.connection(peer).ok_or_else(|| {
                TorrentError::PeerConnectionError {
                    reason: format!("peer {}:{} is not connected", peer.ip, peer.port),
                }
            })?;
            let expected_hash = *state
                .metainfo
                .piece_hashes
                .get(piece_index.as_u32() as usize)
                .ok_or_else(|| TorrentError::ProtocolViolation {
                    message: format!("piece {piece_index} is out of range"),
                })?;
            (connection, state.metainfo.piece_size(piece_index), expected_hash)
        };

        let downloaded = {
            let mut connection = connection.lock().await;
            downloader::download_piece(
                &mut connection,
                piece_index,
                piece_size,
                &expected_hash,
                self.config.torrent.block_size,
                self.config.torrent.block_timeout,
            )
            .await
        };

        let hash_key = info_hash.to_string();
        match downloaded {
            Ok(bytes) => {
                {
                    let torrents = self.torrents.read().await;
                    let state = torrents
                        .get(&info_hash)
                        .ok_or(TorrentError::UnknownTorrent { info_hash })?;
                    self.write_piece_bytes(&hash_key, &state.metainfo, piece_index, &bytes)
                        .await?;
                }
                let mut torrents = self.torrents.write().await;
                let state = torrents
                    .get_mut(&info_hash)
                    .ok_or(TorrentError::UnknownTorrent { info_hash })?;
                state.roll_time();
                state.have[piece_index.as_u32() as usize] = true;
                state.stats.downloaded += bytes.len() as u64;
                state.recompute_progress();
                self.database
                    .write_torrent_stats(&hash_key, &state.stats.to_bytes())
                    .await?;
                Ok(())
            }
            Err(TorrentError::PieceHashMismatch { index }) => {
                let mut torrents = self.torrents.write().await;
                if let Some(state) = torrents.get_mut(&info_hash) {
                    state.roll_time();
                    state.stats.wasted += u64::from(piece_size);
                    self.database
                        .write_torrent_stats(&hash_key, &state.stats.to_bytes())
                        .await?;
                }
                Err(TorrentError::PieceHashMismatch { index })
            }
            Err(error) => Err(error),
        }
    }

    /// Uploads a piece the peer has requested, serving blocks until the
    /// peer stays quiet for the configured window.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    /// - `TorrentError::PeerConnectionError` - If the peer is not connected
    ///   or a send failed
    /// - `TorrentError::ProtocolViolation` - If the peer never requested
    ///   this piece
    pub async fn send_piece(
        &self,
        info_hash: InfoHash,
        peer: &KnownPeer,
        piece_index: PieceIndex,
    ) -> Result<(), TorrentError> {
        let (connection, piece_metainfo) = {
            let torrents = self.torrents.read().await;
            let state = torrents
                .get(&info_hash)
                .ok_or(TorrentError::UnknownTorrent { info_hash })?;
            let connection = state.connection(peer).ok_or_else(|| {
                TorrentError::PeerConnectionError {
                    reason: format!("peer {}:{} is not connected", peer.ip, peer.port),
                }
            })?;
            (connection, state.metainfo.clone())
        };

        let hash_key = info_hash.to_string();
        let piece_bytes = self
            .read_piece_bytes(&hash_key, &piece_metainfo, piece_index)
            .await?;

        let sent = {
            let mut connection = connection.lock().await;
            if !connection
                .state()
                .requested_by_peer
                .contains_key(&piece_index)
            {
                return Err(TorrentError::ProtocolViolation {
                    message: format!(
                        "peer {}:{} never requested piece {piece_index}",
                        peer.ip, peer.port
                    ),
                });
            }
            downloader::upload_piece(
                &mut connection,
                piece_index,
                &piece_bytes,
                self.config.torrent.upload_quiet_window,
            )
            .await?
        };

        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        state.roll_time();
        state.stats.uploaded += sent;
        self.database
            .write_torrent_stats(&hash_key, &state.stats.to_bytes())
            .await?;
        Ok(())
    }

    /// For every connected, non-choking peer with pieces we lack, lists up
    /// to `per_peer` downloadable piece indices, enumerated cyclically from
    /// `start_index`. Lists across peers may overlap.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn available_pieces(
        &self,
        info_hash: InfoHash,
        per_peer: usize,
        start_index: u32,
    ) -> Result<HashMap<KnownPeer, Vec<PieceIndex>>, TorrentError> {
        let torrents = self.torrents.read().await;
        let state = torrents
            .get(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;

        let mut available = HashMap::new();
        for ((ip, port), connection) in &state.connections {
            let Ok(connection) = connection.try_lock() else {
                continue;
            };
            if connection.state().peer_choking {
                continue;
            }
            let pieces = downloader::cyclic_available(
                &connection.state().have_set,
                &state.have,
                per_peer,
                start_index,
            );
            if !pieces.is_empty() {
                available.insert(KnownPeer::new(ip.clone(), *port), pieces);
            }
        }
        Ok(available)
    }

    /// Lists the distinct piece indices requested by each peer we are not
    /// choking.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn requested_pieces(
        &self,
        info_hash: InfoHash,
    ) -> Result<HashMap<KnownPeer, Vec<PieceIndex>>, TorrentError> {
        let torrents = self.torrents.read().await;
        let state = torrents
            .get(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;

        let mut requested = HashMap::new();
        for ((ip, port), connection) in &state.connections {
            let Ok(connection) = connection.try_lock() else {
                continue;
            };
            if connection.state().am_choking {
                continue;
            }
            let pieces = connection.state().requested_pieces();
            if !pieces.is_empty() {
                requested.insert(KnownPeer::new(ip.clone(), *port), pieces);
            }
        }
        Ok(requested)
    }

    /// Returns the torrent's stored file contents keyed by slash-joined
    /// path. Bytes never downloaded are zeroed.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn files(
        &self,
        info_hash: InfoHash,
    ) -> Result<HashMap<String, Vec<u8>>, TorrentError> {
        let files = {
            let torrents = self.torrents.read().await;
            let state = torrents
                .get(&info_hash)
                .ok_or(TorrentError::UnknownTorrent { info_hash })?;
            state.metainfo.files.clone()
        };

        let hash_key = info_hash.to_string();
        let mut contents = HashMap::new();
        for file in files {
            let path = file.joined_path();
            let mut bytes = self
                .database
                .file(&hash_key, &path)
                .await?
                .unwrap_or_default();
            bytes.resize(file.length as usize, 0);
            contents.insert(path, bytes);
        }
        Ok(contents)
    }

    /// Loads file contents into storage. Unknown names are ignored, short
    /// contents are zero-padded, long contents truncated.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn load_files(
        &self,
        info_hash: InfoHash,
        files: HashMap<String, Vec<u8>>,
    ) -> Result<(), TorrentError> {
        let expected = {
            let torrents = self.torrents.read().await;
            let state = torrents
                .get(&info_hash)
                .ok_or(TorrentError::UnknownTorrent { info_hash })?;
            state.metainfo.files.clone()
        };

        let hash_key = info_hash.to_string();
        for file in expected {
            let path = file.joined_path();
            let mut bytes = files.get(&path).cloned().unwrap_or_default();
            bytes.resize(file.length as usize, 0);
            self.database.write_file(&hash_key, &path, &bytes).await?;
        }
        Ok(())
    }

    /// Re-verifies every piece against the metainfo piece table. Pieces that
    /// fail are zeroed in storage and marked not held.
    ///
    /// Returns true only if the entire piece table verified.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UnknownTorrent` - If the info-hash is not loaded
    pub async fn recheck(&self, info_hash: InfoHash) -> Result<bool, TorrentError> {
        let parsed = {
            let torrents = self.torrents.read().await;
            let state = torrents
                .get(&info_hash)
                .ok_or(TorrentError::UnknownTorrent { info_hash })?;
            state.metainfo.clone()
        };

        // Concatenated file bytes, gaps zero-filled.
        let hash_key = info_hash.to_string();
        let stored = self.files(info_hash).await?;
        let mut content = Vec::with_capacity(parsed.total_length as usize);
        for file in &parsed.files {
            content.extend_from_slice(&stored[&file.joined_path()]);
        }

        let held = downloader::recheck_pieces(&mut content, parsed.piece_length, &parsed.piece_hashes);

        // Write the zeroed content back, file by file.
        let mut offset = 0usize;
        for file in &parsed.files {
            let end = offset + file.length as usize;
            self.database
                .write_file(&hash_key, &file.joined_path(), &content[offset..end])
                .await?;
            offset = end;
        }

        let all_held = held.iter().all(|held| *held);
        let mut torrents = self.torrents.write().await;
        let state = torrents
            .get_mut(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        state.roll_time();
        state.have = held;
        state.recompute_progress();
        self.database
            .write_torrent_stats(&hash_key, &state.stats.to_bytes())
            .await?;
        Ok(all_held)
    }

    async fn connection_for(
        &self,
        info_hash: InfoHash,
        peer: &KnownPeer,
    ) -> Result<Arc<Mutex<PeerConnection>>, TorrentError> {
        let torrents = self.torrents.read().await;
        let state = torrents
            .get(&info_hash)
            .ok_or(TorrentError::UnknownTorrent { info_hash })?;
        state
            .connection(peer)
            .ok_or_else(|| TorrentError::PeerConnectionError {
                reason: format!("peer {}:{} is not connected", peer.ip, peer.port),
            })
    }

    async fn accept_pending_peers(&self) -> Result<(), TorrentError> {
        let listener = self.listener.lock().await;
        let Some(listener) = listener.as_ref() else {
            return Ok(());
        };

        // Drain what is already pending, bounded per pass.
        for _ in 0..8 {
            let accepted =
                match tokio::time::timeout(Duration::from_millis(10), listener.accept()).await {
                    Err(_) => break,
                    Ok(Err(error)) => {
                        tracing::warn!("Accept failed: {error}");
                        break;
                    }
                    Ok(Ok(accepted)) => accepted,
                };
            let (stream, address) = accepted;

            let loaded: Vec<InfoHash> = self.torrents.read().await.keys().copied().collect();
            let handshake = tokio::time::timeout(
                self.config.network.dispatch_wait,
                PeerConnection::accept(stream, address, self.peer_id, &loaded),
            )
            .await;
            match handshake {
                Err(_) => tracing::debug!("Inbound peer {address} stalled during handshake"),
                Ok(Err(error)) => tracing::debug!("Rejected inbound peer {address}: {error}"),
                Ok(Ok((connection, info_hash))) => {
                    let ip = address.ip().to_string();
                    let port = address.port();
                    let mut peer = KnownPeer::new(ip.clone(), port);
                    peer.peer_id = Some(connection.remote_peer_id().as_bytes().to_vec());

                    let mut torrents = self.torrents.write().await;
                    if let Some(state) = torrents.get_mut(&info_hash) {
                        state.registry.insert_all([peer]);
                        state
                            .connections
                            .insert((ip.clone(), port), Arc::new(Mutex::new(connection)));
                        let hash_key = info_hash.to_string();
                        self.database
                            .set_peer_validity(&hash_key, &ip, port, true)
                            .await?;
                        self.database
                            .write_peer_set(&hash_key, &encode_peer_set(&state.registry))
                            .await?;
                        tracing::debug!("Accepted inbound peer {address} for {info_hash}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch_connections(&self) {
        let keepalive = self.config.torrent.keepalive_interval;
        let mut torrents = self.torrents.write().await;
        for state in torrents.values_mut() {
            let have = state.have.clone();
            let keys: Vec<(String, u16)> = state.connections.keys().cloned().collect();
            let per_connection_wait =
                self.config.network.dispatch_wait / (keys.len().max(1) as u32);

            let mut dead = Vec::new();
            for key in keys {
                let Some(connection) = state.connections.get(&key).cloned() else {
                    continue;
                };
                // Connections busy in a piece transfer service themselves.
                let Ok(mut connection) = connection.try_lock() else {
                    continue;
                };
                if let Err(error) =
                    service_connection(&mut connection, &have, per_connection_wait, keepalive)
                        .await
                {
                    tracing::debug!("Dropping peer {}:{}: {error}", key.0, key.1);
                    dead.push(key);
                }
            }
            for key in dead {
                state.connections.remove(&key);
            }
        }
    }

    /// Splices a verified piece into the affected files in storage.
    async fn write_piece_bytes(
        &self,
        hash_key: &str,
        parsed: &Metainfo,
        piece_index: PieceIndex,
        bytes: &[u8],
    ) -> Result<(), TorrentError> {
        for range in piece_file_ranges(parsed, piece_index) {
            let file = &parsed.files[range.file_index];
            let path = file.joined_path();
            let mut contents = self
                .database
                .file(hash_key, &path)
                .await?
                .unwrap_or_default();
            contents.resize(file.length as usize, 0);
            contents[range.file_offset..range.file_offset + range.length]
                .copy_from_slice(&bytes[range.piece_offset..range.piece_offset + range.length]);
            self.database.write_file(hash_key, &path, &contents).await?;
        }
        Ok(())
    }

    /// Reassembles a piece from the stored files, zero-filling gaps.
    async fn read_piece_bytes(
        &self,
        hash_key: &str,
        parsed: &Metainfo,
        piece_index: PieceIndex,
    ) -> Result<Vec<u8>, TorrentError> {
        let mut bytes = vec![0u8; parsed.piece_size(piece_index) as usize];
        for range in piece_file_ranges(parsed, piece_index) {
            let file = &parsed.files[range.file_index];
            let mut contents = self
                .database
                .file(hash_key, &file.joined_path())
                .await?
                .unwrap_or_default();
            contents.resize(file.length as usize, 0);
            bytes[range.piece_offset..range.piece_offset + range.length]
                .copy_from_slice(&contents[range.file_offset..range.file_offset + range.length]);
        }
        Ok(bytes)
    }
}

/// One pass over a single connection: drain readable messages, re-evaluate
/// interest, send a keep-alive if due.
async fn service_connection(
    connection: &mut PeerConnection,
    have: &[bool],
    wait: Duration,
    keepalive: Duration,
) -> Result<(), TorrentError> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match connection.poll_receive(deadline - now).await? {
            None => break,
            Some(message) => connection.apply(&message),
        }
    }

    // Interested exactly when the peer has a piece we lack.
    let wants = connection
        .state()
        .have_set
        .iter()
        .any(|piece| !have.get(piece.as_u32() as usize).copied().unwrap_or(false));
    if wants && !connection.state().am_interested {
        connection.send(&PeerMessage::Interested).await?;
        connection.state_mut().am_interested = true;
    } else if !wants && connection.state().am_interested {
        connection.send(&PeerMessage::NotInterested).await?;
        connection.state_mut().am_interested = false;
    }

    if connection.needs_keepalive(keepalive) {
        connection.send(&PeerMessage::KeepAlive).await?;
    }
    Ok(())
}

/// BEP 12 STARTED shuffle: the tier order and the URLs within each tier are
/// shuffled independently; the URL set is preserved.
fn shuffle_tiers(tiers: &mut Vec<Vec<String>>) {
    let mut rng = rand::rng();
    tiers.shuffle(&mut rng);
    for tier in tiers.iter_mut() {
        tier.shuffle(&mut rng);
    }
}

fn encode_peer_set(registry: &PeerRegistry) -> Vec<u8> {
    BencodeValue::list(
        registry
            .known_peers()
            .iter()
            .map(|peer| {
                BencodeValue::dict(vec![
                    (b"ip".to_vec(), BencodeValue::bytes(peer.ip.as_bytes())),
                    (b"port".to_vec(), BencodeValue::integer(i64::from(peer.port))),
                ])
            })
            .collect(),
    )
    .encode()
}

struct FileRange {
    file_index: usize,
    file_offset: usize,
    piece_offset: usize,
    length: usize,
}

/// Maps a piece onto the byte ranges of the files it spans.
fn piece_file_ranges(parsed: &Metainfo, piece_index: PieceIndex) -> Vec<FileRange> {
    let piece_start = u64::from(piece_index.as_u32()) * u64::from(parsed.piece_length);
    let piece_end = piece_start + u64::from(parsed.piece_size(piece_index));

    let mut ranges = Vec::new();
    let mut file_start = 0u64;
    for (file_index, file) in parsed.files.iter().enumerate() {
        let file_end = file_start + file.length;
        let overlap_start = piece_start.max(file_start);
        let overlap_end = piece_end.min(file_end);
        if overlap_start < overlap_end {
            ranges.push(FileRange {
                file_index,
                file_offset: (overlap_start - file_start) as usize,
                piece_offset: (overlap_start - piece_start) as usize,
                length: (overlap_end - overlap_start) as usize,
            });
        }
        file_start = file_end;
    }
    ranges
}
