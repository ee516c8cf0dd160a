//! Tracing setup for Ebbtide embedders.
//!
//! The core only emits `tracing` events; binaries and test harnesses that
//! want them rendered call [`init_tracing`] once at startup.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initializes a console subscriber at the given default level.
///
/// `RUST_LOG` overrides the level when set. Calling this twice is an error
/// from the global-subscriber registry, so embedders should call it exactly
/// once.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If a global subscriber is already set
pub fn init_tracing(
    console_level: Level,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()?;

    tracing::debug!("Tracing initialized at {console_level}");
    Ok(())
}
