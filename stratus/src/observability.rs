//! Log subscriber setup.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "stratus=info";

/// Installs a global `tracing` subscriber filtered by `RUST_LOG`.
///
/// Emits JSON lines when `json` is true. Returns false if a global subscriber
/// was already installed, in which case nothing changes.
pub fn init_tracing(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().with_current_span(true).try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}
