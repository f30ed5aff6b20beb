// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// db_root = "/var/lib/gridflow"
/// idle_delay_ms = 500
///
/// [server]
/// port = 8756
/// auth_tokens = ["sekrit"]
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Engine behaviour from `[engine]`.
    #[serde(default)]
    pub engine: EngineSection,

    /// API server settings from `[server]`.
    #[serde(default)]
    pub server: ServerSection,
}

/// Validated configuration handed to the rest of the application.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub server: ServerSection,
}

impl ConfigFile {
    /// Construct without re-validating. Only `TryFrom<RawConfigFile>` and
    /// tests should call this.
    pub fn new_unchecked(engine: EngineSection, server: ServerSection) -> Self {
        Self { engine, server }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Root directory of the persistent store.
    #[serde(default = "default_db_root")]
    pub db_root: PathBuf,

    /// Delay between ticks when nothing advanced, in milliseconds.
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,

    /// Global cap on concurrent backend operations.
    #[serde(default = "default_workers_total")]
    pub workers_total: usize,

    /// Per-host cap on concurrent backend operations.
    #[serde(default = "default_workers_per_host")]
    pub workers_per_host: usize,

    /// Per-host cap on concurrent transport sessions (ssh etc.).
    #[serde(default = "default_sessions_per_host")]
    pub sessions_per_host: usize,

    /// Deadline for a backend `start`, in seconds.
    #[serde(default = "default_start_deadline_secs")]
    pub start_deadline_secs: u64,

    /// Deadline for a backend `update`, in seconds.
    #[serde(default = "default_update_deadline_secs")]
    pub update_deadline_secs: u64,

    /// Base delay for retrying recoverable start failures, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on the retry delay, in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_db_root() -> PathBuf {
    PathBuf::from(".gridflow")
}

fn default_idle_delay_ms() -> u64 {
    500
}

fn default_workers_total() -> usize {
    64
}

fn default_workers_per_host() -> usize {
    16
}

fn default_sessions_per_host() -> usize {
    8
}

fn default_start_deadline_secs() -> u64 {
    300
}

fn default_update_deadline_secs() -> u64 {
    60
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            db_root: default_db_root(),
            idle_delay_ms: default_idle_delay_ms(),
            workers_total: default_workers_total(),
            workers_per_host: default_workers_per_host(),
            sessions_per_host: default_sessions_per_host(),
            start_deadline_secs: default_start_deadline_secs(),
            update_deadline_secs: default_update_deadline_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerSection {
    /// TCP port the API server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accepted bearer tokens. The server refuses to boot with an empty
    /// list; engine-only invocations ignore this section.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
}

fn default_port() -> u16 {
    8756
}
