//! Optional `tracing` subscriber setup for binaries and tests.
//!
//! Library code only emits events; embedding applications that already own a
//! subscriber should not call [`init_logging`].

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global fmt subscriber filtered by `filter` (for example `"pagecache=debug"`).
///
/// `RUST_LOG` takes precedence when set. Returns false if a subscriber was
/// already installed.
pub fn init_logging(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
