//! Structured logging init: a `FmtSubscriber` with a fixed level set once
//! at startup, rather than a per-call `println!`.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already initialized (e.g. called twice in tests); not fatal.
    }
}
