//! Logging setup for the `council` binary.
//!
//! Agent output owns stdout, so every log line goes to stderr. Audit events
//! arrive on the `council::audit` target and are filtered like any other
//! target. Library code only emits events; this is called once from `main`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"council=info"`) when it is
/// set and parses. With `log_json` every line is one JSON object, which keeps
/// audit records machine-readable.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = env_filter(std::env::var("RUST_LOG").ok().as_deref(), default_filter);
    let registry = tracing_subscriber::registry().with(filter);
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    if log_json {
        registry.with(fmt.json().flatten_event(true)).init();
    } else {
        registry.with(fmt.compact()).init();
    }
}

/// A blank or unparsable `RUST_LOG` falls back to `default_filter`.
fn env_filter(rust_log: Option<&str>, default_filter: &str) -> EnvFilter {
    rust_log
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_default() {
        let filter = env_filter(Some("council_engine=debug"), "council=info");
        assert_eq!(filter.to_string(), "council_engine=debug");
    }

    #[test]
    fn blank_rust_log_uses_default() {
        assert_eq!(env_filter(None, "council=info").to_string(), "council=info");
        assert_eq!(env_filter(Some("  "), "council=info").to_string(), "council=info");
    }
}
