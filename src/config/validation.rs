use crate::error::{Error, Result};

use super::Config;

/// Validate a loaded configuration before it is handed to the daemon or
/// the model manager.
pub fn validate(config: &Config) -> Result<()> {
    if config.memory.max_ram_mb == 0 {
        return Err(Error::Config(
            "memory.max_ram_mb must be a positive integer".to_string(),
        ));
    }

    if config.daemon.socket_path.as_os_str().is_empty() {
        return Err(Error::Config(
            "daemon.socket_path must not be empty".to_string(),
        ));
    }

    if config.daemon.max_connections == 0 {
        return Err(Error::Config(
            "daemon.max_connections must be a positive integer".to_string(),
        ));
    }

    for (slot, cfg) in &config.models {
        if cfg.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "models.{slot}.name must not be empty"
            )));
        }
        if cfg.memory_estimate_mb == 0 {
            return Err(Error::Config(format!(
                "models.{slot}.memory_estimate_mb must be a positive integer"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeepLoaded, ModelSlotConfig};

    fn valid_config() -> Config {
        Config::load(Some(std::path::Path::new("/nonexistent/config.yaml"))).unwrap()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn zero_budget_rejected() {
        let mut config = valid_config();
        config.memory.max_ram_mb = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn empty_model_name_rejected() {
        let mut config = valid_config();
        config.models.insert(
            "embedder".to_string(),
            ModelSlotConfig {
                name: "  ".to_string(),
                keep_loaded: KeepLoaded::Always,
                idle_timeout_seconds: 0,
                memory_estimate_mb: 450,
            },
        );
        assert!(validate(&config).is_err());
    }
}
