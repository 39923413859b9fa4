//! Logging setup.
//!
//! The crate logs through `tracing`. Nothing is printed until a subscriber
//! is installed, either by the embedding application or by [`init`].
//!
//! - `CONVOY_LOG` overrides the filter (e.g. `convoy=debug,convoy::core=trace`)
//! - `CONVOY_DEBUG=1` selects debug level for this crate

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{fmt, EnvFilter};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

const LOG_ENV: &str = "CONVOY_LOG";
const DEBUG_ENV: &str = "CONVOY_DEBUG";

/// Install a stderr subscriber at info level.
pub fn init() {
    init_with_debug(false);
}

/// Install a stderr subscriber, at debug level if `debug` or
/// `CONVOY_DEBUG` asks for it.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(debug = debug_enabled, "logging initialised");
    }
}

/// Whether debug logging was requested by the last init call.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    format!("convoy={}", level)
}
