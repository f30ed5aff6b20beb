// src/backend/yarn.rs

//! YARN batch backend.
//!
//! Submission is a daemonized launcher process (same mechanics as the
//! `process` backend) whose program is expected to submit a YARN
//! application. Once the application id shows up in the launcher's output,
//! `update` records it in the run parameters so that `kill` can also cancel
//! the application itself.

use std::path::PathBuf;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::process::{
    daemonize_start, kill_process_group, playground_queries, poll_daemonized, query_playground,
    DaemonPoll, Daemonized,
};
use crate::backend::{rp_open, rp_wrap, Backend, KillOutcome, PollOutcome, StartOutcome};
use crate::host::{Host, HostError};

pub const RP_VERSION: u32 = 1;

fn default_playground_root() -> PathBuf {
    PathBuf::from("/tmp/gridflow")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct YarnRp {
    command: String,
    #[serde(default = "default_playground_root")]
    playground_root: PathBuf,
    #[serde(default)]
    running: Option<YarnRunning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct YarnRunning {
    #[serde(flatten)]
    daemon: Daemonized,
    /// Learned from the launcher's output while the job runs.
    #[serde(default)]
    application_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct YarnBackend;

#[async_trait]
impl Backend for YarnBackend {
    fn name(&self) -> &'static str {
        "yarn"
    }

    fn create(&self, config: serde_json::Value) -> Result<serde_json::Value, String> {
        let rp: YarnRp =
            serde_json::from_value(config).map_err(|e| format!("yarn backend config: {e}"))?;
        if rp.command.trim().is_empty() {
            return Err("yarn backend config: empty command".to_string());
        }
        serde_json::to_value(&rp)
            .map(|payload| rp_wrap(RP_VERSION, payload))
            .map_err(|e| e.to_string())
    }

    async fn start(&self, rp: &serde_json::Value, host: &Host) -> StartOutcome {
        let mut rp: YarnRp = match open_rp(rp) {
            Ok(rp) => rp,
            Err(reason) => return StartOutcome::Fatal(reason),
        };

        match daemonize_start(host, &rp.playground_root, &rp.command).await {
            Ok(daemon) => {
                rp.running = Some(YarnRunning {
                    daemon,
                    application_id: None,
                });
                match serde_json::to_value(&rp) {
                    Ok(payload) => StartOutcome::Started(rp_wrap(RP_VERSION, payload)),
                    Err(e) => StartOutcome::Fatal(format!("serializing run parameters: {e}")),
                }
            }
            Err(outcome) => outcome,
        }
    }

    async fn update(&self, rp: &serde_json::Value, host: &Host) -> PollOutcome {
        let mut parsed: YarnRp = match open_rp(rp) {
            Ok(parsed) => parsed,
            Err(reason) => return PollOutcome::Failed(rp.clone(), reason),
        };
        let running = match &mut parsed.running {
            Some(running) => running,
            None => {
                return PollOutcome::Failed(
                    rp.clone(),
                    "update called on never-started run parameters".to_string(),
                )
            }
        };

        // Learn the application id as soon as the launcher prints it.
        let mut refreshed = false;
        if running.application_id.is_none() {
            if let Some(app_id) = sniff_application_id(host, &running.daemon).await {
                debug!(%app_id, "yarn application id learned");
                running.application_id = Some(app_id);
                refreshed = true;
            }
        }

        let rp_now = if refreshed {
            match serde_json::to_value(&parsed) {
                Ok(payload) => rp_wrap(RP_VERSION, payload),
                Err(e) => return PollOutcome::TryAgain(format!("serializing run parameters: {e}")),
            }
        } else {
            rp.clone()
        };

        let running = match &parsed.running {
            Some(running) => running,
            None => unreachable!("running checked above"),
        };
        match poll_daemonized(host, &running.daemon).await {
            DaemonPoll::Running => PollOutcome::StillRunning(rp_now),
            DaemonPoll::Succeeded => PollOutcome::Succeeded(rp_now),
            DaemonPoll::Failed(reason) => PollOutcome::Failed(rp_now, reason),
            DaemonPoll::TryAgain(reason) => PollOutcome::TryAgain(reason),
        }
    }

    async fn kill(&self, rp: &serde_json::Value, host: &Host) -> KillOutcome {
        let parsed: YarnRp = match open_rp(rp) {
            Ok(parsed) => parsed,
            Err(_) => return KillOutcome::Killed,
        };
        let running = match &parsed.running {
            Some(running) => running,
            None => return KillOutcome::Killed,
        };

        // Best effort on the application; the resource manager also reaps
        // it when the launcher dies, so a failure here is not fatal.
        if let Some(app_id) = &running.application_id {
            let cmd = format!("yarn application -kill {app_id}");
            match host.run_command(&cmd).await {
                Ok(out) if out.exit != 0 => {
                    warn!(%app_id, exit = out.exit, "yarn application -kill failed");
                }
                Err(e) => return KillOutcome::TryAgain(e.to_string()),
                _ => {}
            }
        }

        kill_process_group(host, running.daemon.pid).await
    }

    async fn query(
        &self,
        rp: &serde_json::Value,
        host: &Host,
        item: &str,
    ) -> Result<Vec<u8>, String> {
        let parsed: YarnRp = open_rp(rp)?;
        let running = parsed
            .running
            .as_ref()
            .ok_or_else(|| "job has not started".to_string())?;

        if item == "application-id" {
            return match &running.application_id {
                Some(app_id) => Ok(app_id.clone().into_bytes()),
                None => Err("application id not yet known".to_string()),
            };
        }
        query_playground(host, &running.daemon, item).await
    }

    fn additional_queries(&self, _rp: &serde_json::Value) -> Vec<(String, String)> {
        let mut queries = playground_queries();
        queries.push((
            "application-id".to_string(),
            "YARN application id, once known".to_string(),
        ));
        queries
    }
}

fn open_rp(rp: &serde_json::Value) -> Result<YarnRp, String> {
    let payload = rp_open(rp, RP_VERSION)?;
    serde_json::from_value(payload.clone()).map_err(|e| format!("yarn run parameters: {e}"))
}

/// Scan the launcher's stdout/stderr for an `application_<ts>_<n>` token.
async fn sniff_application_id(host: &Host, daemon: &Daemonized) -> Option<String> {
    let pattern = match Regex::new(r"application_[0-9]+_[0-9]+") {
        Ok(pattern) => pattern,
        Err(_) => return None,
    };

    for path in [
        daemon.playground.stderr_path(),
        daemon.playground.stdout_path(),
    ] {
        match host.get_file(&path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                if let Some(m) = pattern.find(&text) {
                    return Some(m.as_str().to_string());
                }
            }
            Err(HostError::MissingFile(_)) => {}
            Err(_) => return None,
        }
    }
    None
}
