//! Tracing setup for binaries, demos and tests.
//!
//! The library itself only emits `tracing` events; installing a
//! subscriber is up to the host.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install a formatting subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once. Returns `false` if a global subscriber was
/// already installed, by this function or by someone else.
///
/// # Examples
///
/// ```
/// twinfold::init_tracing();
/// assert!(!twinfold::init_tracing());
/// ```
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}
