//! HTTP tracker communication: announce with BEP 12 tier fallback, scrape,
//! and peer-list decoding.

pub mod client;
pub mod types;

pub use client::{HttpTransport, TrackerClient};
pub use types::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, AnnounceWalk, ScrapeData, ScrapeOutcome,
    ScrapeUpdate, Transport, UrlAttempt,
};
