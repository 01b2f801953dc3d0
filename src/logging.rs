//! Tracing initialization.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::consts::LOG_ENV;

static INIT: Once = Once::new();

/// Install the global subscriber.
///
/// Filter directives come from `SCANHIVE_LOG` (e.g.
/// `SCANHIVE_LOG=scanhive::executor=debug`), falling back to
/// `scanhive=info`, or `scanhive=debug` when `verbose` is set. Output goes
/// to stderr so results printed on stdout stay machine-readable.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_tracing(verbose: bool) {
    INIT.call_once(|| {
        let fallback = if verbose {
            "scanhive=debug"
        } else {
            "scanhive=info"
        };
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .init();
    });
}
