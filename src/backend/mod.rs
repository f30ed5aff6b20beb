// src/backend/mod.rs

//! Backend plugins: how jobs start, get polled, and get killed on an
//! execution substrate.
//!
//! Backends are compiled-in modules registered by name into a
//! [`BackendRegistry`]; run parameters are backend-opaque JSON carried in a
//! small versioned envelope. The engine never looks inside.
//!
//! Error classification is explicit at this seam: backends return sum
//! outcomes, never raw transport errors, so the engine cannot mistake a
//! dropped connection for a failed target.

pub mod lsf;
pub mod pbs;
pub mod process;
pub mod script;
pub mod yarn;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::host::Host;

/// Outcome of a submission attempt.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The job was accepted; the value is the new running run-parameters.
    Started(serde_json::Value),
    /// Worth retrying with backoff (connectivity, scheduler busy).
    Recoverable(String),
    /// Submission can never succeed (malformed program, bad config).
    Fatal(String),
}

/// Outcome of polling a running job.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// Still going; run parameters may have been refreshed.
    StillRunning(serde_json::Value),
    Succeeded(serde_json::Value),
    Failed(serde_json::Value, String),
    /// Transport fault; state is unchanged, poll again next tick.
    TryAgain(String),
}

/// Outcome of a cancel request.
#[derive(Debug, Clone)]
pub enum KillOutcome {
    Killed,
    /// Transport fault; retry next tick.
    TryAgain(String),
}

/// A compiled-in execution backend.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build fresh run parameters from a creation config (API payload).
    fn create(&self, config: serde_json::Value) -> Result<serde_json::Value, String>;

    /// Submit the job described by `rp` on `host`.
    async fn start(&self, rp: &serde_json::Value, host: &Host) -> StartOutcome;

    /// Poll the job; reads the monitored log before asking the scheduler.
    async fn update(&self, rp: &serde_json::Value, host: &Host) -> PollOutcome;

    /// Cancel the job. Idempotent: killing a finished job reports `Killed`.
    async fn kill(&self, rp: &serde_json::Value, host: &Host) -> KillOutcome;

    /// Fetch a named diagnostic stream. Unknown names fail non-fatally.
    async fn query(
        &self,
        rp: &serde_json::Value,
        host: &Host,
        item: &str,
    ) -> Result<Vec<u8>, String>;

    /// `(name, description)` pairs for the streams `query` understands.
    fn additional_queries(&self, rp: &serde_json::Value) -> Vec<(String, String)>;
}

/// Registry of backends by name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    map: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All compiled-in backends.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(process::ProcessBackend::default()));
        registry.register(Arc::new(pbs::PbsBackend::default()));
        registry.register(Arc::new(lsf::LsfBackend::default()));
        registry.register(Arc::new(yarn::YarnBackend::default()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.map.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.map.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// Wrap a backend payload in its versioned envelope.
pub fn rp_wrap(version: u32, payload: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "version": version, "payload": payload })
}

/// Open a run-parameters envelope, checking the version.
pub fn rp_open(rp: &serde_json::Value, expected: u32) -> Result<&serde_json::Value, String> {
    let version = rp
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "run parameters have no version field".to_string())?;
    if version != u64::from(expected) {
        return Err(format!(
            "run parameters are version {version}, this backend expects {expected}"
        ));
    }
    rp.get("payload")
        .ok_or_else(|| "run parameters have no payload".to_string())
}
