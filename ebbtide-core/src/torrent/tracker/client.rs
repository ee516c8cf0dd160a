//! HTTP tracker client: announce tier walk, peer-list decoding and scrape.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{
    AnnounceRequest, AnnounceResponse, AnnounceWalk, ScrapeOutcome, ScrapeUpdate, Transport,
    UrlAttempt,
};
use crate::config::NetworkConfig;
use crate::torrent::bencode::BencodeValue;
use crate::torrent::peers::KnownPeer;
use crate::torrent::{InfoHash, TorrentError};

/// Reported for transport-level failures, as opposed to tracker-reported
/// failure reasons.
pub(crate) const CONNECTION_FAILED: &str = "Connection failed";

/// Tracker client walking BEP 12 announce tiers over a [`Transport`].
pub struct TrackerClient<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> TrackerClient<T> {
    /// Creates a client over the given transport collaborator.
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Walks the announce tiers in order, URL by URL, until one tracker
    /// returns an interval.
    ///
    /// Transport failures and tracker failure reasons move the walk to the
    /// next URL. Peers decoded from any well-formed response accumulate even
    /// when that response carried no interval. The walk performs no
    /// shuffling; callers reorder tiers on STARTED events before calling.
    pub async fn announce(
        &self,
        tiers: &[Vec<String>],
        request: &AnnounceRequest,
    ) -> AnnounceWalk {
        let mut walk = AnnounceWalk {
            attempts: Vec::new(),
            peers: Vec::new(),
            outcome: None,
        };
        let params = Self::announce_params(request);

        for tier in tiers {
            for url in tier {
                tracing::debug!("Announcing to tracker: {url}");
                let body = match self.transport.get(url, &params).await {
                    Ok(body) => body,
                    Err(error) => {
                        tracing::warn!("Tracker {url} failed: {error}");
                        walk.attempts.push((
                            url.clone(),
                            UrlAttempt::Failed {
                                reason: CONNECTION_FAILED.to_string(),
                            },
                        ));
                        continue;
                    }
                };

                match Self::parse_announce_response(&body) {
                    Err(TorrentError::TrackerUnreachable { reason }) => {
                        tracing::warn!("Tracker {url} reported failure: {reason}");
                        walk.attempts
                            .push((url.clone(), UrlAttempt::Failed { reason }));
                    }
                    Err(error) => {
                        tracing::warn!("Tracker {url} sent a malformed response: {error}");
                        walk.attempts.push((
                            url.clone(),
                            UrlAttempt::Failed {
                                reason: CONNECTION_FAILED.to_string(),
                            },
                        ));
                    }
                    Ok(response) => {
                        tracing::debug!(
                            "Tracker {url} returned {} peers",
                            response.peers.len()
                        );
                        walk.peers.extend(response.peers);
                        walk.attempts.push((
                            url.clone(),
                            UrlAttempt::Responded {
                                complete: response.complete,
                                incomplete: response.incomplete,
                            },
                        ));
                        if let Some(interval) = response.interval {
                            walk.outcome = Some((url.clone(), interval));
                            return walk;
                        }
                    }
                }
            }
        }

        walk
    }

    /// Scrapes one tracker for this torrent's statistics.
    ///
    /// Returns `None` when the URL has no "announce" path segment to
    /// rewrite; such trackers are skipped, not errored. Transport failures
    /// and malformed responses yield a "Connection failed" entry.
    pub async fn scrape(
        &self,
        announce_url: &str,
        info_hash: InfoHash,
    ) -> Option<ScrapeOutcome> {
        let scrape_url = derive_scrape_url(announce_url)?;
        let params = vec![(
            "info_hash".to_string(),
            url_encode_bytes(info_hash.as_bytes()),
        )];

        tracing::debug!("Scraping tracker: {scrape_url}");
        let outcome = match self.transport.get(&scrape_url, &params).await {
            Err(error) => {
                tracing::warn!("Tracker scrape {scrape_url} failed: {error}");
                ScrapeOutcome::Failure {
                    reason: CONNECTION_FAILED.to_string(),
                }
            }
            Ok(body) => Self::parse_scrape_response(&body, info_hash).unwrap_or_else(|error| {
                tracing::warn!("Tracker {scrape_url} sent a malformed scrape response: {error}");
                ScrapeOutcome::Failure {
                    reason: CONNECTION_FAILED.to_string(),
                }
            }),
        };
        Some(outcome)
    }

    fn announce_params(request: &AnnounceRequest) -> Vec<(String, String)> {
        vec![
            (
                "info_hash".to_string(),
                url_encode_bytes(request.info_hash.as_bytes()),
            ),
            (
                "peer_id".to_string(),
                url_encode_bytes(request.peer_id.as_bytes()),
            ),
            ("port".to_string(), request.port.to_string()),
            ("uploaded".to_string(), request.uploaded.to_string()),
            ("downloaded".to_string(), request.downloaded.to_string()),
            ("left".to_string(), request.left.to_string()),
            ("compact".to_string(), "1".to_string()),
            ("event".to_string(), request.event.as_str().to_string()),
        ]
    }

    /// Parses one announce response.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerUnreachable` - If the tracker reported a
    ///   failure reason
    /// - `TorrentError::MalformedEncoding` - If the response is not valid
    ///   bencode or carries an invalid peer list
    pub(crate) fn parse_announce_response(
        body: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let value = BencodeValue::parse(body)?;
        if value.as_dict().is_none() {
            return Err(TorrentError::MalformedEncoding {
                reason: "tracker response must be a dictionary".to_string(),
            });
        }

        if let Some(reason) = value.get(b"failure reason").and_then(|v| v.as_str()) {
            return Err(TorrentError::TrackerUnreachable {
                reason: reason.to_string(),
            });
        }

        let integer =
            |key: &[u8]| -> Option<i64> { value.get(key).and_then(|v| v.as_integer()) };
        let peers = match value.get(b"peers") {
            Some(peers_value) => decode_peer_list(peers_value)?,
            None => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval: integer(b"interval").map(|v| v.max(0) as u32),
            complete: integer(b"complete").map(|v| v.max(0) as u64),
            incomplete: integer(b"incomplete").map(|v| v.max(0) as u64),
            peers,
        })
    }

    fn parse_scrape_response(
        body: &[u8],
        info_hash: InfoHash,
    ) -> Result<ScrapeOutcome, TorrentError> {
        let value = BencodeValue::parse(body)?;
        if let Some(reason) = value.get(b"failure reason").and_then(|v| v.as_str()) {
            return Ok(ScrapeOutcome::Failure {
                reason: reason.to_string(),
            });
        }

        let files = value
            .get(b"files")
            .ok_or_else(|| TorrentError::MalformedEncoding {
                reason: "scrape response without 'files'".to_string(),
            })?;
        let entry = files
            .as_dict()
            .ok_or_else(|| TorrentError::MalformedEncoding {
                reason: "'files' must be a dictionary".to_string(),
            })?
            .iter()
            .find(|(key, _)| key.as_slice() == info_hash.as_bytes())
            .map(|(_, entry)| entry);

        let Some(entry) = entry else {
            return Ok(ScrapeOutcome::NoEntry);
        };

        let integer =
            |key: &[u8]| -> Option<u64> { entry.get(key).and_then(|v| v.as_integer()).map(|v| v.max(0) as u64) };
        Ok(ScrapeOutcome::Stats(ScrapeUpdate {
            complete: integer(b"complete"),
            downloaded: integer(b"downloaded"),
            incomplete: integer(b"incomplete"),
            name: entry
                .get(b"name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }))
    }
}

/// Percent-encodes raw bytes for tracker query strings, preserving the
/// RFC 3986 unreserved set.
pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Rewrites an announce URL to its sibling scrape URL.
///
/// The final path segment must start with "announce"; that prefix becomes
/// "scrape" and any suffix (extension, query string) is preserved. URLs
/// without such a segment return `None`.
pub(crate) fn derive_scrape_url(announce_url: &str) -> Option<String> {
    let slash = announce_url.rfind('/')?;
    let segment = &announce_url[slash + 1..];
    if !segment.starts_with("announce") {
        return None;
    }
    Some(format!(
        "{}/scrape{}",
        &announce_url[..slash],
        &segment["announce".len()..]
    ))
}

/// Decodes a tracker peer list in either wire form.
///
/// A bencoded list holds dictionaries with "ip" and "port"; a byte string is
/// the compact form of consecutive 6-byte big-endian IPv4+port records.
pub(crate) fn decode_peer_list(value: &BencodeValue) -> Result<Vec<KnownPeer>, TorrentError> {
    if let Some(entries) = value.as_list() {
        let mut peers = Vec::with_capacity(entries.len());
        for entry in entries {
            let ip = entry
                .get(b"ip")
                .and_then(|v| v.as_str())
                .ok_or_else(|| TorrentError::MalformedEncoding {
                    reason: "peer entry without 'ip'".to_string(),
                })?;
            let port = entry
                .get(b"port")
                .and_then(|v| v.as_integer())
                .filter(|port| (0..=i64::from(u16::MAX)).contains(port))
                .ok_or_else(|| TorrentError::MalformedEncoding {
                    reason: "peer entry without a valid 'port'".to_string(),
                })?;
            peers.push(KnownPeer::new(ip, port as u16));
        }
        return Ok(peers);
    }

    let bytes = value
        .as_bytes()
        .ok_or_else(|| TorrentError::MalformedEncoding {
            reason: "peer list must be a list or a byte string".to_string(),
        })?;
    if bytes.len() % 6 != 0 {
        return Err(TorrentError::MalformedEncoding {
            reason: "compact peer data length is not a multiple of 6".to_string(),
        });
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let mut record = [0u8; 6];
            record.copy_from_slice(chunk);
            KnownPeer::from_compact(&record)
        })
        .collect())
}

/// Production [`Transport`] over reqwest.
///
/// Parameter values are appended verbatim to avoid double-encoding the
/// percent-encoded info-hash and peer id.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates the HTTP transport from network configuration.
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(config.tracker_timeout)
                .user_agent(config.user_agent)
                .redirect(reqwest::redirect::Policy::limited(3))
                .build()
                .expect("HTTP client creation should not fail"),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<Vec<u8>, TorrentError> {
        let query: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let separator = if url.contains('?') { '&' } else { '?' };
        let full_url = if query.is_empty() {
            url.to_string()
        } else {
            format!("{url}{separator}{}", query.join("&"))
        };

        let parsed_url = url::Url::parse(&full_url)?;
        let response = self.client.get(parsed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::TrackerUnreachable {
                reason: format!("tracker returned HTTP {status}"),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
