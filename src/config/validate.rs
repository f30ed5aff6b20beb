// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{GridflowError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = GridflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.engine, raw.server))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.workers_total == 0 {
        return Err(GridflowError::ConfigError(
            "[engine].workers_total must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.engine.workers_per_host == 0 {
        return Err(GridflowError::ConfigError(
            "[engine].workers_per_host must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.engine.workers_per_host > cfg.engine.workers_total {
        return Err(GridflowError::ConfigError(format!(
            "[engine].workers_per_host ({}) exceeds workers_total ({})",
            cfg.engine.workers_per_host, cfg.engine.workers_total
        )));
    }

    if cfg.engine.sessions_per_host == 0 {
        return Err(GridflowError::ConfigError(
            "[engine].sessions_per_host must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.engine.start_deadline_secs == 0 || cfg.engine.update_deadline_secs == 0 {
        return Err(GridflowError::ConfigError(
            "[engine] deadlines must be >= 1 second".to_string(),
        ));
    }

    if cfg.engine.backoff_base_ms == 0 {
        return Err(GridflowError::ConfigError(
            "[engine].backoff_base_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    Ok(())
}
