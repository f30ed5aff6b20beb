// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw
/// `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and run basic validation.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Applies `DB_URI`, `PORT` and `AUTH_TOKEN` environment overrides.
/// - Checks pool sizes and deadlines for sanity.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let mut raw_config = load_from_path(&path)?;
    apply_env_overrides(&mut raw_config)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Build a configuration without any file on disk: defaults + environment.
///
/// Used when `--config` is not given and no `Gridflow.toml` exists.
pub fn from_env_only() -> Result<ConfigFile> {
    let mut raw = RawConfigFile {
        engine: Default::default(),
        server: Default::default(),
    };
    apply_env_overrides(&mut raw)?;
    let config = ConfigFile::try_from(raw)?;
    Ok(config)
}

/// Server-boot environment variables override the file:
///
/// - `DB_URI`   → `engine.db_root`
/// - `PORT`     → `server.port`
/// - `AUTH_TOKEN` → appended to `server.auth_tokens`
fn apply_env_overrides(raw: &mut RawConfigFile) -> Result<()> {
    if let Ok(db_uri) = std::env::var("DB_URI") {
        raw.engine.db_root = PathBuf::from(db_uri);
    }

    if let Ok(port) = std::env::var("PORT") {
        let parsed: u16 = port.parse().map_err(|_| {
            crate::errors::GridflowError::ConfigError(format!(
                "PORT environment variable is not a valid port: {port}"
            ))
        })?;
        raw.server.port = parsed;
    }

    if let Ok(token) = std::env::var("AUTH_TOKEN") {
        if !token.is_empty() && !raw.server.auth_tokens.contains(&token) {
            raw.server.auth_tokens.push(token);
        }
    }

    Ok(())
}

/// Helper to resolve a default config path.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Gridflow.toml")
}
