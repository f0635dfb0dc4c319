//! Tracing subscriber installation.
//!
//! The library itself only emits `tracing` events. Binaries and tests that
//! want to see them call [`init_tracing`] once; the filter comes from
//! `KEEL_LOG` and falls back to `info`.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INITIALISED: OnceLock<bool> = OnceLock::new();

/// Install a formatting subscriber filtered by `KEEL_LOG`.
///
/// Returns false when another global subscriber was already installed; the
/// existing one stays in place. Calling this more than once is harmless.
pub fn init_tracing() -> bool {
    *INITIALISED.get_or_init(|| {
        let filter = EnvFilter::try_from_env("KEEL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let first = init_tracing();
        let second = init_tracing();
        assert_eq!(first, second);
        tracing::debug!("subscriber installed");
    }
}
