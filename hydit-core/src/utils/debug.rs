use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::DEBUG;

/// Install the global `tracing` subscriber.
///
/// The default level is `INFO`, or `DEBUG` when `HYDIT_DEBUG=1`. `RUST_LOG`
/// directives take precedence. Calling this more than once is a no-op.
pub fn initialize_logging() {
    let is_debug = std::env::var("HYDIT_DEBUG")
        .unwrap_or_default()
        .contains('1');
    DEBUG.store(is_debug, std::sync::atomic::Ordering::Relaxed);

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
