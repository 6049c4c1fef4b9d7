//! Thin logging facade shared by the server binary and library: callers
//! get `trace!`/`debug!`/`info!`/`warn!`/`error!` from this crate and
//! never depend on `tracing` directly.

pub use tracing::{debug, error, info, trace, warn};

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber honoring `RUST_LOG`, defaulting
/// to `info`. Idempotent: safe to call more than once (e.g. from tests),
/// later calls are ignored.
pub fn init_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
