// src/backend/process.rs

//! Generic daemonized-process backend.
//!
//! Works on any [`Host`]: the monitored script is written into a fresh
//! playground and launched with `setsid`, detached from the submitting
//! session. Polling reads the monitored log first and only then checks
//! whether the process group is still alive.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::script::{
    last_verdict, parse_monitor_log, render_script, Playground, Verdict,
};
use crate::backend::{rp_open, rp_wrap, Backend, KillOutcome, PollOutcome, StartOutcome};
use crate::host::{shell_quote, Host, HostError};

pub const RP_VERSION: u32 = 1;

fn default_playground_root() -> PathBuf {
    PathBuf::from("/tmp/gridflow")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessRp {
    command: String,
    #[serde(default = "default_playground_root")]
    playground_root: PathBuf,
    #[serde(default)]
    running: Option<Daemonized>,
}

/// Everything `start` learns about the launched process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Daemonized {
    pub playground: Playground,
    pub pid: i32,
    pub script: String,
}

#[derive(Debug, Default)]
pub struct ProcessBackend;

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn create(&self, config: serde_json::Value) -> Result<serde_json::Value, String> {
        let rp: ProcessRp = serde_json::from_value(config)
            .map_err(|e| format!("process backend config: {e}"))?;
        if rp.command.trim().is_empty() {
            return Err("process backend config: empty command".to_string());
        }
        serde_json::to_value(&rp)
            .map(|payload| rp_wrap(RP_VERSION, payload))
            .map_err(|e| e.to_string())
    }

    async fn start(&self, rp: &serde_json::Value, host: &Host) -> StartOutcome {
        let mut rp: ProcessRp = match open_rp(rp) {
            Ok(rp) => rp,
            Err(reason) => return StartOutcome::Fatal(reason),
        };

        match daemonize_start(host, &rp.playground_root, &rp.command).await {
            Ok(running) => {
                rp.running = Some(running);
                match serde_json::to_value(&rp) {
                    Ok(payload) => StartOutcome::Started(rp_wrap(RP_VERSION, payload)),
                    Err(e) => StartOutcome::Fatal(format!("serializing run parameters: {e}")),
                }
            }
            Err(outcome) => outcome,
        }
    }

    async fn update(&self, rp: &serde_json::Value, host: &Host) -> PollOutcome {
        let parsed: ProcessRp = match open_rp(rp) {
            Ok(parsed) => parsed,
            Err(reason) => return PollOutcome::Failed(rp.clone(), reason),
        };
        let running = match &parsed.running {
            Some(running) => running,
            None => {
                return PollOutcome::Failed(
                    rp.clone(),
                    "update called on never-started run parameters".to_string(),
                )
            }
        };

        match poll_daemonized(host, running).await {
            DaemonPoll::Running => PollOutcome::StillRunning(rp.clone()),
            DaemonPoll::Succeeded => PollOutcome::Succeeded(rp.clone()),
            DaemonPoll::Failed(reason) => PollOutcome::Failed(rp.clone(), reason),
            DaemonPoll::TryAgain(reason) => PollOutcome::TryAgain(reason),
        }
    }

    async fn kill(&self, rp: &serde_json::Value, host: &Host) -> KillOutcome {
        let parsed: ProcessRp = match open_rp(rp) {
            Ok(parsed) => parsed,
            // Nothing we can address; treat as already gone.
            Err(_) => return KillOutcome::Killed,
        };
        match &parsed.running {
            Some(running) => kill_process_group(host, running.pid).await,
            None => KillOutcome::Killed,
        }
    }

    async fn query(
        &self,
        rp: &serde_json::Value,
        host: &Host,
        item: &str,
    ) -> Result<Vec<u8>, String> {
        let parsed: ProcessRp = open_rp(rp)?;
        let running = parsed
            .running
            .as_ref()
            .ok_or_else(|| "job has not started".to_string())?;
        query_playground(host, running, item).await
    }

    fn additional_queries(&self, _rp: &serde_json::Value) -> Vec<(String, String)> {
        playground_queries()
    }
}

fn open_rp(rp: &serde_json::Value) -> Result<ProcessRp, String> {
    let payload = rp_open(rp, RP_VERSION)?;
    serde_json::from_value(payload.clone()).map_err(|e| format!("process run parameters: {e}"))
}

/// Shared by the process and yarn backends.
pub(crate) fn playground_queries() -> Vec<(String, String)> {
    vec![
        ("stdout".to_string(), "standard output of the program".to_string()),
        ("stderr".to_string(), "standard error of the program".to_string()),
        ("log".to_string(), "monitored-script log".to_string()),
        ("script".to_string(), "the submitted monitored script".to_string()),
    ]
}

/// Fetch a named playground stream.
pub(crate) async fn query_playground(
    host: &Host,
    running: &Daemonized,
    item: &str,
) -> Result<Vec<u8>, String> {
    let path = match item {
        "stdout" => running.playground.stdout_path(),
        "stderr" => running.playground.stderr_path(),
        "log" => running.playground.log_path(),
        "script" => return Ok(running.script.clone().into_bytes()),
        other => return Err(format!("unknown query: {other}")),
    };
    host.get_file(&path).await.map_err(|e| e.to_string())
}

/// Write the monitored script into a fresh playground and launch it,
/// detached, as its own process group.
pub(crate) async fn daemonize_start(
    host: &Host,
    playground_root: &Path,
    command: &str,
) -> Result<Daemonized, StartOutcome> {
    let playground = Playground::fresh(playground_root);
    if let Err(e) = host.ensure_directory(&playground.root).await {
        return Err(classify_start_error(e));
    }

    let script = render_script(command, &playground.log_path(), "cmd");
    if let Err(e) = host.put_file(&playground.script_path(), script.as_bytes()).await {
        return Err(classify_start_error(e));
    }

    let launch = format!(
        "setsid sh {script} > {stdout} 2> {stderr} < /dev/null & echo $!",
        script = shell_quote(&playground.script_path().to_string_lossy()),
        stdout = shell_quote(&playground.stdout_path().to_string_lossy()),
        stderr = shell_quote(&playground.stderr_path().to_string_lossy()),
    );
    let out = match host.run_command(&launch).await {
        Ok(out) => out,
        Err(e) => return Err(classify_start_error(e)),
    };
    if out.exit != 0 {
        return Err(StartOutcome::Recoverable(format!(
            "launch exited {}: {}",
            out.exit,
            out.stderr.trim()
        )));
    }

    let pid: i32 = match out.stdout.trim().parse() {
        Ok(pid) => pid,
        // Exit 0 but no pid: the shell misbehaved, retrying won't change it.
        Err(_) => {
            return Err(StartOutcome::Fatal(format!(
                "launch produced no pid: {:?}",
                out.stdout.trim()
            )))
        }
    };

    debug!(pid, playground = %playground.root.display(), "daemonized process started");
    Ok(Daemonized {
        playground,
        pid,
        script,
    })
}

pub(crate) enum DaemonPoll {
    Running,
    Succeeded,
    Failed(String),
    TryAgain(String),
}

/// Log-first polling; the process table is only a liveness hint.
pub(crate) async fn poll_daemonized(host: &Host, running: &Daemonized) -> DaemonPoll {
    match read_verdict(host, running).await {
        Ok(Some(Verdict::Success)) => return DaemonPoll::Succeeded,
        Ok(Some(Verdict::Failure { label, exit })) => {
            return DaemonPoll::Failed(format!("program step '{label}' exited {exit}"))
        }
        Ok(None) => {}
        Err(reason) => return DaemonPoll::TryAgain(reason),
    }

    let probe = format!("kill -0 -- -{} 2>/dev/null", running.pid);
    let alive = match host.run_command(&probe).await {
        Ok(out) => out.exit == 0,
        Err(e) => return DaemonPoll::TryAgain(e.to_string()),
    };
    if alive {
        return DaemonPoll::Running;
    }

    // The group is gone; one more read closes the window where the script
    // wrote its verdict between our two checks.
    match read_verdict(host, running).await {
        Ok(Some(Verdict::Success)) => DaemonPoll::Succeeded,
        Ok(Some(Verdict::Failure { label, exit })) => {
            DaemonPoll::Failed(format!("program step '{label}' exited {exit}"))
        }
        Ok(None) => DaemonPoll::Failed(
            "process exited without writing a verdict to the monitored log".to_string(),
        ),
        Err(reason) => DaemonPoll::TryAgain(reason),
    }
}

async fn read_verdict(host: &Host, running: &Daemonized) -> Result<Option<Verdict>, String> {
    match host.get_file(&running.playground.log_path()).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(last_verdict(&parse_monitor_log(&text)))
        }
        // The script may not have written anything yet.
        Err(HostError::MissingFile(_)) => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

/// TERM the whole process group. Idempotent: an already-gone group still
/// reports `Killed`.
pub(crate) async fn kill_process_group(host: &Host, pid: i32) -> KillOutcome {
    let cmd = format!("kill -TERM -- -{pid} 2>/dev/null");
    match host.run_command(&cmd).await {
        Ok(_) => KillOutcome::Killed,
        Err(e) => KillOutcome::TryAgain(e.to_string()),
    }
}

pub(crate) fn classify_start_error(e: HostError) -> StartOutcome {
    match e {
        HostError::Unreachable(reason) => StartOutcome::Recoverable(reason),
        HostError::Filesystem(reason) | HostError::MissingFile(reason) => {
            StartOutcome::Fatal(reason)
        }
    }
}
