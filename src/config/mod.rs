// src/config/mod.rs

//! Configuration loading and validation.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, from_env_only, load_and_validate, load_from_path};
pub use model::{ConfigFile, EngineSection, RawConfigFile, ServerSection};
