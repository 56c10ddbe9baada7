// =============================================================================
// Matrixon Room Server - Logging
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

use matrixon_common::{MatrixonError, Result};
use matrixon_core::RoomServerConfig;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Filter for the configured directives, `warn` when they do not parse.
pub fn env_filter(directives: &str) -> EnvFilter {
    match EnvFilter::try_new(directives) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::new("warn")
        }
    }
}

/// Installs the global `tracing` subscriber.
pub fn init(config: &RoomServerConfig) -> Result<()> {
    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = env_filter(&config.log);

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| MatrixonError::Config(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_directives_fall_back_to_warn() {
        let filter = env_filter("matrixon_roomserver=notalevel");
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_good_directives_are_kept() {
        let filter = env_filter("warn,matrixon_roomserver=debug");
        assert!(filter.to_string().contains("matrixon_roomserver=debug"));
    }
}
