//! Factory configuration.
//!
//! Provides the factory's identity and wiring knobs, with hierarchical
//! loading: built-in defaults, then an optional `mats.toml` in the working
//! directory, then `MATS_*` environment variables (highest precedence).

use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::error::{MatsError, MatsResult};

/// Configuration recognized by [`MatsFactory`](crate::MatsFactory).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Factory identity, for logs. Default `""`.
    pub name: String,
    /// Prefix for every broker destination. Default `"mats."`.
    pub destination_prefix: String,
    /// Body key under which the envelope travels. Default `"mats:trace"`.
    pub trace_key: String,
    /// Application name, surfaced in envelopes and logs.
    pub app_name: String,
    /// Application version, surfaced in envelopes and logs.
    pub app_version: String,
    /// Node name, surfaced in envelopes and logs. Default: the hostname.
    pub nodename: String,
    /// Default worker slots per stage. Default: 2 × available parallelism.
    pub concurrency: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            destination_prefix: "mats.".to_string(),
            trace_key: "mats:trace".to_string(),
            app_name: "unnamed-app".to_string(),
            app_version: "0.0.0".to_string(),
            nodename: hostname(),
            concurrency: thread::available_parallelism().map_or(2, |n| n.get() * 2),
        }
    }
}

impl FactoryConfig {
    /// Loads configuration from defaults, an optional `mats.toml` in the
    /// current directory, and `MATS_*` environment variables.
    pub fn load() -> MatsResult<Self> {
        Self::load_from(Path::new("."))
    }

    /// Like [`load`](Self::load) with an explicit directory for `mats.toml`.
    pub fn load_from(dir: &Path) -> MatsResult<Self> {
        let mut builder = config::Config::builder();

        let defaults = FactoryConfig::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults)
                .map_err(|e| MatsError::Lifecycle(format!("config defaults: {e}")))?,
        );

        let config_file: PathBuf = dir.join("mats.toml");
        if config_file.exists() {
            builder = builder.add_source(
                config::File::from(config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MATS")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| MatsError::Lifecycle(format!("failed to load configuration: {e}")))
    }

    /// Loads configuration or returns the defaults if loading fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = FactoryConfig::default();
        assert_eq!(config.name, "");
        assert_eq!(config.destination_prefix, "mats.");
        assert_eq!(config.trace_key, "mats:trace");
        assert!(config.concurrency >= 2);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("mats.toml"),
            r#"
name = "orders-factory"
app_name = "orders"
app_version = "2.1.0"
concurrency = 4
"#,
        )
        .expect("write config");

        let config = FactoryConfig::load_from(dir.path()).expect("load");
        assert_eq!(config.name, "orders-factory");
        assert_eq!(config.app_name, "orders");
        assert_eq!(config.app_version, "2.1.0");
        assert_eq!(config.concurrency, 4);
        // Untouched keys keep their defaults.
        assert_eq!(config.destination_prefix, "mats.");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = FactoryConfig::load_from(dir.path()).expect("load");
        assert_eq!(config.trace_key, "mats:trace");
    }

    // Environment variable precedence (MATS__CONCURRENCY etc.) is exercised
    // in real deployments; the config crate caches process env, which makes
    // it unreliable to assert from unit tests running in parallel.
}
