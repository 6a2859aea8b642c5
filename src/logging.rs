//! `tracing`/`tracing-subscriber` init helper.
//!
//! The engine itself only ever calls `tracing::{debug,trace,warn}!` —
//! it never configures a subscriber. Grounded in the pack's own
//! `main`-side init pattern (`cooprefr-bettersys/rust-backend/src/
//! main.rs`'s `init_tracing`, `bin/live_recorder.rs`'s inline
//! `tracing_subscriber::fmt()` setup): a binary embedding this crate
//! calls [`init`] once at startup; a library caller is free to install
//! its own subscriber instead.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `info` for this crate and `warn` for everything else when the
/// environment variable isn't set. `debug` additionally lowers this
/// crate's own default to `debug`, matching the `Logging.debug?` flag
/// in the simulation config (§6).
pub fn init(debug: bool) {
    let default_directive = if debug { "taosim_exchange=debug,warn" } else { "taosim_exchange=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt().with_env_filter(filter).finish().try_init().ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_never_panics() {
        init(false);
        init(true);
    }
}
