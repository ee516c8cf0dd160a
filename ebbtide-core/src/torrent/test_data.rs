//! Shared fixtures for torrent tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use super::bencode::BencodeValue;
use super::peers::KnownPeer;
use super::tracker::Transport;
use super::TorrentError;

/// SHA-1 digest helper for fixtures and assertions.
pub fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn info_dict(name: &str, piece_length: u32, content: &[u8]) -> BencodeValue {
    let piece_hashes: Vec<u8> = content
        .chunks(piece_length as usize)
        .flat_map(|chunk| sha1_of(chunk))
        .collect();
    BencodeValue::dict(vec![
        (
            b"length".to_vec(),
            BencodeValue::integer(content.len() as i64),
        ),
        (b"name".to_vec(), BencodeValue::bytes(name.as_bytes())),
        (
            b"piece length".to_vec(),
            BencodeValue::integer(i64::from(piece_length)),
        ),
        (b"pieces".to_vec(), BencodeValue::bytes(piece_hashes)),
    ])
}

/// Builds a single-file metainfo buffer whose piece table hashes `content`.
pub fn single_file_torrent(
    announce: &str,
    name: &str,
    piece_length: u32,
    content: &[u8],
) -> Vec<u8> {
    BencodeValue::dict(vec![
        (b"announce".to_vec(), BencodeValue::bytes(announce.as_bytes())),
        (b"info".to_vec(), info_dict(name, piece_length, content)),
    ])
    .encode()
}

/// Builds a metainfo buffer carrying a BEP 12 announce-list.
pub fn torrent_with_tiers(
    announce: &str,
    tiers: &[&[&str]],
    name: &str,
    piece_length: u32,
    content: &[u8],
) -> Vec<u8> {
    let tier_values = tiers
        .iter()
        .map(|tier| {
            BencodeValue::list(
                tier.iter()
                    .map(|url| BencodeValue::bytes(url.as_bytes()))
                    .collect(),
            )
        })
        .collect();
    BencodeValue::dict(vec![
        (b"announce".to_vec(), BencodeValue::bytes(announce.as_bytes())),
        (b"announce-list".to_vec(), BencodeValue::list(tier_values)),
        (b"info".to_vec(), info_dict(name, piece_length, content)),
    ])
    .encode()
}

/// Builds a multi-file metainfo buffer; `files` maps slash-free path
/// components to lengths, pieces hash `content` (the files' concatenation).
pub fn multi_file_torrent(
    announce: &str,
    name: &str,
    piece_length: u32,
    files: &[(&[&str], u64)],
    content: &[u8],
) -> Vec<u8> {
    let piece_hashes: Vec<u8> = content
        .chunks(piece_length as usize)
        .flat_map(|chunk| sha1_of(chunk))
        .collect();
    let file_values = files
        .iter()
        .map(|(path, length)| {
            BencodeValue::dict(vec![
                (b"length".to_vec(), BencodeValue::integer(*length as i64)),
                (
                    b"path".to_vec(),
                    BencodeValue::list(
                        path.iter()
                            .map(|component| BencodeValue::bytes(component.as_bytes()))
                            .collect(),
                    ),
                ),
            ])
        })
        .collect();
    let info = BencodeValue::dict(vec![
        (b"files".to_vec(), BencodeValue::list(file_values)),
        (b"name".to_vec(), BencodeValue::bytes(name.as_bytes())),
        (
            b"piece length".to_vec(),
            BencodeValue::integer(i64::from(piece_length)),
        ),
        (b"pieces".to_vec(), BencodeValue::bytes(piece_hashes)),
    ]);
    BencodeValue::dict(vec![
        (b"announce".to_vec(), BencodeValue::bytes(announce.as_bytes())),
        (b"info".to_vec(), info),
    ])
    .encode()
}

/// Peer fixture without a peer id.
pub fn peer(ip: &str, port: u16) -> KnownPeer {
    KnownPeer::new(ip, port)
}

/// Bencoded announce response with a compact peer list.
pub fn compact_announce_response(interval: u32, peers: &[(&str, u16)]) -> Vec<u8> {
    let mut compact = Vec::with_capacity(peers.len() * 6);
    for (ip, port) in peers {
        let addr: std::net::Ipv4Addr = ip.parse().unwrap();
        compact.extend_from_slice(&addr.octets());
        compact.extend_from_slice(&port.to_be_bytes());
    }
    BencodeValue::dict(vec![
        (
            b"interval".to_vec(),
            BencodeValue::integer(i64::from(interval)),
        ),
        (b"peers".to_vec(), BencodeValue::bytes(compact)),
    ])
    .encode()
}

/// Scripted [`Transport`] serving queued responses per URL.
///
/// URLs without a staged response fail like an unreachable tracker; every
/// request is recorded for assertions.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<Result<Vec<u8>, ()>>>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response body for a URL.
    pub fn stage(&self, url: &str, body: Vec<u8>) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(Ok(body));
    }

    /// Queues a transport failure for a URL.
    pub fn stage_failure(&self, url: &str) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(Err(()));
    }

    /// Returns all recorded requests.
    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.requests.lock().unwrap().clone()
    }

    /// Returns the URLs requested, in order.
    pub fn requested_urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<Vec<u8>, TorrentError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), params.to_vec()));
        let staged = self
            .responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        match staged {
            Some(Ok(body)) => Ok(body),
            Some(Err(())) | None => Err(TorrentError::TrackerUnreachable {
                reason: format!("no scripted response for {url}"),
            }),
        }
    }
}

/// Bencoded announce response with a non-compact (dictionary list) peer list.
pub fn dict_announce_response(interval: u32, peers: &[(&str, u16)]) -> Vec<u8> {
    let peer_values = peers
        .iter()
        .map(|(ip, port)| {
            BencodeValue::dict(vec![
                (b"ip".to_vec(), BencodeValue::bytes(ip.as_bytes())),
                (b"port".to_vec(), BencodeValue::integer(i64::from(*port))),
            ])
        })
        .collect();
    BencodeValue::dict(vec![
        (
            b"interval".to_vec(),
            BencodeValue::integer(i64::from(interval)),
        ),
        (b"peers".to_vec(), BencodeValue::list(peer_values)),
    ])
    .encode()
}
