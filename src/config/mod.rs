mod types;
mod validation;

pub use types::*;
pub use validation::validate;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Environment variable naming the default store path.
pub const DB_ENV_VAR: &str = "FASTSEARCH_DB";

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "FASTSEARCH_CONFIG";

/// Top-level fastsearch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub models: ModelSlots,
    pub memory: MemoryConfig,
}

impl Config {
    /// Load configuration from file, environment, and defaults.
    ///
    /// Resolution order: explicit `path`, `FASTSEARCH_CONFIG`, then
    /// `~/.config/fastsearch/config.yaml`. A missing file yields defaults.
    /// File entries for the canonical slots overlay the default slot table;
    /// the slot set itself is fixed at start-up.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
            .unwrap_or_else(default_config_path);

        let mut config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let content = std::fs::read_to_string(&config_path)?;
            let loaded: Config = serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {e}", config_path.display())))?;
            loaded
        } else {
            Config::default()
        };

        // Default slots exist even when the file omits the models section.
        let defaults = default_slots();
        for (slot, cfg) in defaults {
            config.models.entry(slot).or_insert(cfg);
        }

        // Resolve unset memory estimates to the built-in per-slot values.
        for (slot, cfg) in config.models.iter_mut() {
            if cfg.memory_estimate_mb == 0 {
                cfg.memory_estimate_mb = default_memory_estimate_mb(slot);
            }
        }

        validate(&config)?;
        Ok(config)
    }

    /// Write the default configuration as YAML.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut config = Config::default();
        config.models = default_slots();
        let yaml = serde_yaml::to_string(&config)
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// The store path used when a request does not name one:
    /// `FASTSEARCH_DB` or `fastsearch.db` in the working directory.
    pub fn default_db_path() -> PathBuf {
        std::env::var(DB_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("fastsearch.db"))
    }
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".config").join("fastsearch").join("config.yaml"))
        .unwrap_or_else(|| PathBuf::from("fastsearch.yaml"))
}

fn default_slots() -> ModelSlots {
    let mut slots = ModelSlots::new();
    slots.insert(
        "embedder".to_string(),
        ModelSlotConfig {
            name: "BAAI/bge-base-en-v1.5".to_string(),
            keep_loaded: KeepLoaded::Always,
            idle_timeout_seconds: 0,
            memory_estimate_mb: default_memory_estimate_mb("embedder"),
        },
    );
    slots.insert(
        "reranker".to_string(),
        ModelSlotConfig {
            name: "BAAI/bge-reranker-base".to_string(),
            keep_loaded: KeepLoaded::OnDemand,
            idle_timeout_seconds: 300,
            memory_estimate_mb: default_memory_estimate_mb("reranker"),
        },
    );
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_canonical_slots() {
        let config = Config::load(Some(Path::new("/nonexistent/config.yaml"))).unwrap();
        assert!(config.models.contains_key("embedder"));
        assert!(config.models.contains_key("reranker"));
        assert_eq!(config.models["embedder"].keep_loaded, KeepLoaded::Always);
        assert_eq!(config.models["embedder"].memory_estimate_mb, 450);
        assert_eq!(config.memory.max_ram_mb, 4000);
    }

    #[test]
    fn yaml_overlays_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "daemon:\n  socket_path: /tmp/test.sock\n  log_level: DEBUG\n\
             models:\n  reranker:\n    name: BAAI/bge-reranker-base\n    keep_loaded: disabled\n\
             memory:\n  max_ram_mb: 500\n  eviction_policy: fifo\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.daemon.log_level, LogLevel::Debug);
        assert_eq!(config.memory.max_ram_mb, 500);
        assert_eq!(config.memory.eviction_policy, EvictionPolicy::Fifo);
        assert_eq!(config.models["reranker"].keep_loaded, KeepLoaded::Disabled);
        // Slot left out of the file keeps its defaults.
        assert_eq!(config.models["embedder"].keep_loaded, KeepLoaded::Always);
    }

    #[test]
    fn write_default_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        Config::write_default(&path).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.models["embedder"].name, "BAAI/bge-base-en-v1.5");
        assert_eq!(
            config.daemon.socket_path,
            PathBuf::from("/tmp/fastsearch.sock")
        );
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "daemon: [not, a, mapping").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
