//! Tracing/logging initialization for overmux binaries.
//!
//! Libraries only emit `tracing` events; binaries install the subscriber
//! once at startup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Default filter directive for a log level, scoped to the overmux crates
/// so that dependency chatter stays at `warn`.
pub fn default_directive(level: &str) -> String {
    format!("warn,overmux={level},overmux_core={level},overmux_cli={level}")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `log.level` when set. With `log.json` the output is
/// structured JSON lines instead of the human-readable format.
pub fn init_tracing(log: &LogConfig) {
    let env_filter = std::env::var("RUST_LOG")
        .map_or_else(|_| EnvFilter::new(default_directive(&log.level)), EnvFilter::new);

    if log.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_scopes_level_to_overmux_crates() {
        let directive = default_directive("debug");
        assert!(directive.starts_with("warn,"));
        assert!(directive.contains("overmux=debug"));
        assert!(directive.contains("overmux_cli=debug"));
    }
}
