//! Core types for BitTorrent tracker communication.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::torrent::bencode::BencodeValue;
use crate::torrent::peers::KnownPeer;
use crate::torrent::protocol::PeerId;
use crate::torrent::{InfoHash, TorrentError};

/// Tracker announce request.
///
/// Client statistics and torrent identity sent on every announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Torrent being announced
    pub info_hash: InfoHash,
    /// Client's 20-byte identifier
    pub peer_id: PeerId,
    /// TCP port the client listens on for peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download (0 for seeders)
    pub left: u64,
    /// Client state change being reported
    pub event: AnnounceEvent,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Client started downloading this torrent
    Started,
    /// Client stopped downloading this torrent
    Stopped,
    /// Client completed downloading this torrent
    Completed,
}

impl AnnounceEvent {
    /// Tracker protocol string for the event.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// One tracker's parsed announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next announce, when the tracker provided one
    pub interval: Option<u32>,
    /// Number of seeders, when reported
    pub complete: Option<u64>,
    /// Number of leechers, when reported
    pub incomplete: Option<u64>,
    /// Decoded peer list (compact or dictionary form)
    pub peers: Vec<KnownPeer>,
}

/// What happened at one URL during a tier walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlAttempt {
    /// The tracker answered with a well-formed response
    Responded {
        complete: Option<u64>,
        incomplete: Option<u64>,
    },
    /// Transport failure, HTTP error, tracker failure reason, or a
    /// malformed response
    Failed { reason: String },
}

/// Result of walking the announce tiers.
#[derive(Debug, Clone)]
pub struct AnnounceWalk {
    /// Per-URL outcomes, in the order the URLs were tried
    pub attempts: Vec<(String, UrlAttempt)>,
    /// Union of all peers decoded from successful responses
    pub peers: Vec<KnownPeer>,
    /// Responding URL and its announce interval, when the walk succeeded
    pub outcome: Option<(String, u32)>,
}

impl AnnounceWalk {
    /// Most recent tracker-reported failure reason, if any URL failed with
    /// one.
    pub fn last_failure(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|(_, attempt)| match attempt {
                UrlAttempt::Failed { reason } => Some(reason.as_str()),
                UrlAttempt::Responded { .. } => None,
            })
    }
}

/// Fields present in one scrape response entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeUpdate {
    pub complete: Option<u64>,
    pub downloaded: Option<u64>,
    pub incomplete: Option<u64>,
    pub name: Option<String>,
}

/// Result of scraping one tracker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// The tracker returned statistics for the torrent
    Stats(ScrapeUpdate),
    /// The tracker answered but had no entry for the torrent
    NoEntry,
    /// The tracker failed; "Connection failed" for transport errors
    Failure { reason: String },
}

/// Latest statistics seen from one tracker URL.
///
/// Updated by both announce and scrape calls. Fields a response omitted keep
/// their previously seen values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrapeData {
    Scrape {
        complete: u64,
        downloaded: u64,
        incomplete: u64,
        name: Option<String>,
    },
    Failure {
        reason: String,
    },
}

impl ScrapeData {
    /// Folds a scrape update into the previously stored entry, preserving
    /// fields the new response did not carry.
    pub fn apply(previous: Option<&ScrapeData>, update: &ScrapeUpdate) -> ScrapeData {
        let (mut complete, mut downloaded, mut incomplete, mut name) = match previous {
            Some(ScrapeData::Scrape {
                complete,
                downloaded,
                incomplete,
                name,
            }) => (*complete, *downloaded, *incomplete, name.clone()),
            _ => (0, 0, 0, None),
        };
        if let Some(value) = update.complete {
            complete = value;
        }
        if let Some(value) = update.downloaded {
            downloaded = value;
        }
        if let Some(value) = update.incomplete {
            incomplete = value;
        }
        if update.name.is_some() {
            name = update.name.clone();
        }
        ScrapeData::Scrape {
            complete,
            downloaded,
            incomplete,
            name,
        }
    }

    /// Encodes the entry for persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        let value = match self {
            ScrapeData::Scrape {
                complete,
                downloaded,
                incomplete,
                name,
            } => {
                let mut entries = vec![
                    (b"complete".to_vec(), BencodeValue::integer(*complete as i64)),
                    (
                        b"downloaded".to_vec(),
                        BencodeValue::integer(*downloaded as i64),
                    ),
                    (
                        b"incomplete".to_vec(),
                        BencodeValue::integer(*incomplete as i64),
                    ),
                ];
                if let Some(name) = name {
                    entries.push((b"name".to_vec(), BencodeValue::bytes(name.as_bytes())));
                }
                BencodeValue::dict(entries)
            }
            ScrapeData::Failure { reason } => BencodeValue::dict(vec![(
                b"failure reason".to_vec(),
                BencodeValue::bytes(reason.as_bytes()),
            )]),
        };
        value.encode()
    }

    /// Decodes an entry previously written by [`ScrapeData::to_bytes`].
    ///
    /// # Errors
    ///
    /// - `TorrentError::MalformedEncoding` - If the buffer is not a valid
    ///   entry
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentError> {
        let value = BencodeValue::parse(bytes)?;
        if let Some(reason) = value.get(b"failure reason").and_then(|v| v.as_str()) {
            return Ok(ScrapeData::Failure {
                reason: reason.to_string(),
            });
        }
        let integer = |key: &[u8]| -> u64 {
            value
                .get(key)
                .and_then(|v| v.as_integer())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        Ok(ScrapeData::Scrape {
            complete: integer(b"complete"),
            downloaded: integer(b"downloaded"),
            incomplete: integer(b"incomplete"),
            name: value
                .get(b"name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }
}

/// HTTP transport collaborator used to reach trackers.
///
/// Query parameter values are sent verbatim: callers pre-encode binary
/// values (the raw info-hash) and the transport must not re-encode them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues an HTTP GET and returns the response body.
    ///
    /// # Errors
    ///
    /// - `TorrentError` - Any failure; the tracker walk treats the URL as
    ///   failed and moves on
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<Vec<u8>, TorrentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_strings() {
        assert_eq!(AnnounceEvent::Started.as_str(), "started");
        assert_eq!(AnnounceEvent::Stopped.as_str(), "stopped");
        assert_eq!(AnnounceEvent::Completed.as_str(), "completed");
    }

    #[test]
    fn test_scrape_data_round_trip() {
        let data = ScrapeData::Scrape {
            complete: 10,
            downloaded: 20,
            incomplete: 5,
            name: Some("ubuntu.iso".to_string()),
        };
        assert_eq!(ScrapeData::from_bytes(&data.to_bytes()).unwrap(), data);

        let failure = ScrapeData::Failure {
            reason: "unregistered torrent".to_string(),
        };
        assert_eq!(ScrapeData::from_bytes(&failure.to_bytes()).unwrap(), failure);
    }

    #[test]
    fn test_apply_preserves_missing_fields() {
        let previous = ScrapeData::Scrape {
            complete: 3,
            downloaded: 7,
            incomplete: 1,
            name: Some("f".to_string()),
        };
        let update = ScrapeUpdate {
            complete: Some(4),
            downloaded: None,
            incomplete: Some(2),
            name: None,
        };
        assert_eq!(
            ScrapeData::apply(Some(&previous), &update),
            ScrapeData::Scrape {
                complete: 4,
                downloaded: 7,
                incomplete: 2,
                name: Some("f".to_string()),
            }
        );
    }

    #[test]
    fn test_apply_after_failure_starts_from_zero() {
        let previous = ScrapeData::Failure {
            reason: "down".to_string(),
        };
        let update = ScrapeUpdate {
            complete: Some(1),
            ..ScrapeUpdate::default()
        };
        assert_eq!(
            ScrapeData::apply(Some(&previous), &update),
            ScrapeData::Scrape {
                complete: 1,
                downloaded: 0,
                incomplete: 0,
                name: None,
            }
        );
    }

    #[test]
    fn test_walk_last_failure() {
        let walk = AnnounceWalk {
            attempts: vec![
                (
                    "http://a/announce".to_string(),
                    UrlAttempt::Failed {
                        reason: "Connection failed".to_string(),
                    },
                ),
                (
                    "http://b/announce".to_string(),
                    UrlAttempt::Failed {
                        reason: "unregistered torrent".to_string(),
                    },
                ),
            ],
            peers: Vec::new(),
            outcome: None,
        };
        assert_eq!(walk.last_failure(), Some("unregistered torrent"));
    }
}
