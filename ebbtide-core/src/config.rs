//! Centralized configuration for Ebbtide.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the engine.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Central configuration for all Ebbtide components.
#[derive(Debug, Clone, Default)]
pub struct EbbtideConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
}

/// BitTorrent protocol-specific configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Eight-byte client identifier prefix used in generated peer ids
    pub client_prefix: &'static str,
    /// Fixed seed hashed into the six-hex-char segment of the peer id
    pub peer_id_seed: &'static str,
    /// Block size for piece requests
    pub block_size: u32,
    /// Timeout for a single outstanding block request (None = wait
    /// indefinitely; liveness is then the caller's to impose)
    pub block_timeout: Option<Duration>,
    /// Send a keep-alive after this long without sending anything
    pub keepalive_interval: Duration,
    /// A piece upload completes after this long without a further request
    /// for that piece
    pub upload_quiet_window: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_prefix: "-EB0001-",
            peer_id_seed: "ebbtide-core",
            block_size: 16_384, // 16 KiB, BEP 3 convention
            block_timeout: None,
            keepalive_interval: Duration::from_secs(60),
            upload_quiet_window: Duration::from_millis(100),
        }
    }
}

/// Network communication and tracker configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// TCP connect timeout for outbound peer connections
    pub connect_timeout: Duration,
    /// Ports tried, in order, when binding the peer listener
    pub listen_ports: RangeInclusive<u16>,
    /// Upper bound on waiting for incoming data during one message-dispatch
    /// pass
    pub dispatch_wait: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            user_agent: "ebbtide/0.1.0",
            connect_timeout: Duration::from_secs(3),
            listen_ports: 6881..=6889,
            dispatch_wait: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = EbbtideConfig::default();
        assert_eq!(config.torrent.client_prefix.len(), 8);
        assert_eq!(config.torrent.block_size, 16_384);
        assert!(config.torrent.block_timeout.is_none());
        assert!(config.network.listen_ports.contains(&6881));
        assert!(config.network.listen_ports.contains(&6889));
    }
}
