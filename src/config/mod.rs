// =============================================================================
// Matrixon Room Server - Configuration Loading
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Builds a `RoomServerConfig` from built-in defaults, a TOML file with a
//   `[global]` profile and `MATRIXON_` environment variables.
//
// =============================================================================

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::Uncased,
    Figment,
};
use matrixon_common::{MatrixonError, Result};
use matrixon_core::RoomServerConfig;
use tracing::info;

static SUB_TABLES: [&str; 1] = ["input"];

/// Layered configuration sources, lowest priority first.
pub fn figment(path: impl AsRef<Path>) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(RoomServerConfig::default()))
        .merge(Toml::file(path.as_ref()).nested())
        .merge(Env::prefixed("MATRIXON_").global().map(|k| {
            let mut key: Uncased = k.into();

            for table in SUB_TABLES {
                if k.starts_with(&(table.to_owned() + "_")) {
                    key = Uncased::from(
                        table.to_owned() + "." + k[table.len() + 1..k.len()].as_str(),
                    );
                    break;
                }
            }

            key
        }))
}

/// Loads and validates the configuration.
pub fn load(path: impl AsRef<Path>) -> Result<RoomServerConfig> {
    let config: RoomServerConfig = figment(path.as_ref())
        .extract()
        .map_err(|e| MatrixonError::Config(e.to_string()))?;
    config.validate()?;
    info!(
        path = %path.as_ref().display(),
        server_name = %config.server_name,
        "📁 Configuration loaded"
    );
    Ok(config)
}
