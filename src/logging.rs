//! Tracing/log subscriber setup.
//!
//! Bridges the `log` facade (used by most of this crate's
//! `debug!`/`trace!`/`warn!` call sites) into a
//! `tracing-subscriber` `fmt` layer filtered by an `EnvFilter`, so a
//! single `-v` counter or `JHM_LOG` directive controls both.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// `verbose` is the repeat count of `-v`; 0 is warn-level, each repeat
/// drops one level (info, debug, trace).
pub fn init(verbose: u8) {
    INIT.call_once(|| {
        let _ = tracing_log::LogTracer::init();

        let default_directive = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let filter = crate::env::JHM_LOG
            .clone()
            .map(EnvFilter::new)
            .unwrap_or_else(|| EnvFilter::new(format!("jhm={default_directive}")));

        let subscriber = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .without_time()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
