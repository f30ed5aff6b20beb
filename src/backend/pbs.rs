// src/backend/pbs.rs

//! PBS/Torque backend: `qsub` / `qstat -f1` / `qdel`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::script::{
    last_verdict, parse_monitor_log, render_script, Playground, Verdict,
};
use crate::backend::process::classify_start_error;
use crate::backend::{rp_open, rp_wrap, Backend, KillOutcome, PollOutcome, StartOutcome};
use crate::host::{Host, HostError};

pub const RP_VERSION: u32 = 1;

fn default_playground_root() -> PathBuf {
    PathBuf::from("/tmp/gridflow")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PbsRp {
    command: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    queue: Option<String>,
    /// `HH:MM:SS` wall-time request.
    #[serde(default)]
    wall_time: Option<String>,
    #[serde(default)]
    processors: Option<u32>,
    #[serde(default = "default_playground_root")]
    playground_root: PathBuf,
    #[serde(default)]
    running: Option<PbsRunning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PbsRunning {
    playground: Playground,
    job_id: String,
    script: String,
}

/// Scheduler-reported status, after vendor-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerStatus {
    Running,
    Completed,
    Unknown,
}

#[derive(Debug, Default)]
pub struct PbsBackend;

#[async_trait]
impl Backend for PbsBackend {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn create(&self, config: serde_json::Value) -> Result<serde_json::Value, String> {
        let rp: PbsRp =
            serde_json::from_value(config).map_err(|e| format!("pbs backend config: {e}"))?;
        if rp.command.trim().is_empty() {
            return Err("pbs backend config: empty command".to_string());
        }
        serde_json::to_value(&rp)
            .map(|payload| rp_wrap(RP_VERSION, payload))
            .map_err(|e| e.to_string())
    }

    async fn start(&self, rp: &serde_json::Value, host: &Host) -> StartOutcome {
        let mut rp: PbsRp = match open_rp(rp) {
            Ok(rp) => rp,
            Err(reason) => return StartOutcome::Fatal(reason),
        };

        let playground = Playground::fresh(&rp.playground_root);
        if let Err(e) = host.ensure_directory(&playground.root).await {
            return classify_start_error(e);
        }

        let script = render_script(&rp.command, &playground.log_path(), "cmd");
        if let Err(e) = host
            .put_file(&playground.script_path(), script.as_bytes())
            .await
        {
            return classify_start_error(e);
        }

        let mut argv = vec![
            "qsub".to_string(),
            "-N".to_string(),
            rp.name.clone().unwrap_or_else(|| "gridflow".to_string()),
            "-o".to_string(),
            playground.stdout_path().to_string_lossy().into_owned(),
            "-e".to_string(),
            playground.stderr_path().to_string_lossy().into_owned(),
        ];
        if let Some(queue) = &rp.queue {
            argv.push("-q".to_string());
            argv.push(queue.clone());
        }
        if let Some(wall_time) = &rp.wall_time {
            argv.push("-l".to_string());
            argv.push(format!("walltime={wall_time}"));
        }
        if let Some(processors) = rp.processors {
            argv.push("-l".to_string());
            argv.push(format!("nodes=1:ppn={processors}"));
        }
        argv.push(playground.script_path().to_string_lossy().into_owned());

        let out = match host.execute(&argv).await {
            Ok(out) => out,
            Err(e) => return classify_start_error(e),
        };
        if out.exit != 0 {
            // qsub refusing a submission is usually a transient server
            // condition (queue full, pbs_server restarting).
            return StartOutcome::Recoverable(format!(
                "qsub exited {}: {}",
                out.exit,
                out.stderr.trim()
            ));
        }

        let job_id = out.stdout.trim().to_string();
        if job_id.is_empty() {
            return StartOutcome::Fatal("qsub exited 0 without printing a job id".to_string());
        }

        debug!(%job_id, playground = %playground.root.display(), "pbs job submitted");
        rp.running = Some(PbsRunning {
            playground,
            job_id,
            script,
        });
        match serde_json::to_value(&rp) {
            Ok(payload) => StartOutcome::Started(rp_wrap(RP_VERSION, payload)),
            Err(e) => StartOutcome::Fatal(format!("serializing run parameters: {e}")),
        }
    }

    async fn update(&self, rp: &serde_json::Value, host: &Host) -> PollOutcome {
        let parsed: PbsRp = match open_rp(rp) {
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

        // The monitored log is authoritative when it has a verdict.
        match read_verdict(host, running).await {
            Ok(Some(Verdict::Success)) => return PollOutcome::Succeeded(rp.clone()),
            Ok(Some(Verdict::Failure { label, exit })) => {
                return PollOutcome::Failed(
                    rp.clone(),
                    format!("program step '{label}' exited {exit}"),
                )
            }
            Ok(None) => {}
            Err(reason) => return PollOutcome::TryAgain(reason),
        }

        let status = match scheduler_status(host, &running.job_id).await {
            Ok(status) => status,
            Err(reason) => return PollOutcome::TryAgain(reason),
        };

        match status {
            SchedulerStatus::Running => PollOutcome::StillRunning(rp.clone()),
            SchedulerStatus::Completed | SchedulerStatus::Unknown => {
                // One more read closes the window between qstat and the
                // script's final log write.
                match read_verdict(host, running).await {
                    Ok(Some(Verdict::Success)) => PollOutcome::Succeeded(rp.clone()),
                    Ok(Some(Verdict::Failure { label, exit })) => PollOutcome::Failed(
                        rp.clone(),
                        format!("program step '{label}' exited {exit}"),
                    ),
                    Ok(None) => PollOutcome::Failed(
                        rp.clone(),
                        format!(
                            "job {} left the queue without writing a verdict",
                            running.job_id
                        ),
                    ),
                    Err(reason) => PollOutcome::TryAgain(reason),
                }
            }
        }
    }

    async fn kill(&self, rp: &serde_json::Value, host: &Host) -> KillOutcome {
        let parsed: PbsRp = match open_rp(rp) {
            Ok(parsed) => parsed,
            Err(_) => return KillOutcome::Killed,
        };
        let running = match &parsed.running {
            Some(running) => running,
            None => return KillOutcome::Killed,
        };

        let argv = vec!["qdel".to_string(), running.job_id.clone()];
        match host.execute(&argv).await {
            // qdel on a finished job exits nonzero; kill is idempotent.
            Ok(_) => KillOutcome::Killed,
            Err(e) => KillOutcome::TryAgain(e.to_string()),
        }
    }

    async fn query(
        &self,
        rp: &serde_json::Value,
        host: &Host,
        item: &str,
    ) -> Result<Vec<u8>, String> {
        let parsed: PbsRp = open_rp(rp)?;
        let running = parsed
            .running
            .as_ref()
            .ok_or_else(|| "job has not started".to_string())?;

        let path = match item {
            "stdout" => running.playground.stdout_path(),
            "stderr" => running.playground.stderr_path(),
            "log" => running.playground.log_path(),
            "script" => return Ok(running.script.clone().into_bytes()),
            "qstat" => {
                let argv = vec![
                    "qstat".to_string(),
                    "-f1".to_string(),
                    running.job_id.clone(),
                ];
                let out = host.execute(&argv).await.map_err(|e| e.to_string())?;
                return Ok(out.stdout.into_bytes());
            }
            other => return Err(format!("unknown query: {other}")),
        };
        host.get_file(&path).await.map_err(|e| e.to_string())
    }

    fn additional_queries(&self, _rp: &serde_json::Value) -> Vec<(String, String)> {
        let mut queries = crate::backend::process::playground_queries();
        queries.push((
            "qstat".to_string(),
            "full qstat record for the job".to_string(),
        ));
        queries
    }
}

fn open_rp(rp: &serde_json::Value) -> Result<PbsRp, String> {
    let payload = rp_open(rp, RP_VERSION)?;
    serde_json::from_value(payload.clone()).map_err(|e| format!("pbs run parameters: {e}"))
}

async fn read_verdict(host: &Host, running: &PbsRunning) -> Result<Option<Verdict>, String> {
    match host.get_file(&running.playground.log_path()).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(last_verdict(&parse_monitor_log(&text)))
        }
        Err(HostError::MissingFile(_)) => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

/// Ask qstat and map the vendor state code.
async fn scheduler_status(host: &Host, job_id: &str) -> Result<SchedulerStatus, String> {
    let argv = vec![
        "qstat".to_string(),
        "-f1".to_string(),
        job_id.to_string(),
    ];
    let out = match host.execute(&argv).await {
        Ok(out) => out,
        Err(HostError::Unreachable(reason)) => return Err(reason),
        Err(e) => return Err(e.to_string()),
    };

    // qstat exits nonzero once the job has aged out of the queue.
    if out.exit != 0 {
        return Ok(SchedulerStatus::Unknown);
    }

    match parse_qstat_state(&out.stdout) {
        Some('R') | Some('Q') | Some('W') | Some('H') | Some('T') | Some('E') | Some('S') => {
            Ok(SchedulerStatus::Running)
        }
        Some('C') => Ok(SchedulerStatus::Completed),
        Some(_) | None => Ok(SchedulerStatus::Unknown),
    }
}

/// Extract the `job_state = X` code from `qstat -f1` output.
fn parse_qstat_state(text: &str) -> Option<char> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("job_state") {
            let rest = rest.trim_start();
            if let Some(value) = rest.strip_prefix('=') {
                return value.trim().chars().next();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qstat_state_parsing() {
        let out = "Job Id: 1234.pbsserver\n    Job_Name = gridflow\n    job_state = R\n";
        assert_eq!(parse_qstat_state(out), Some('R'));

        let done = "Job Id: 1234.pbsserver\n    job_state = C\n";
        assert_eq!(parse_qstat_state(done), Some('C'));

        assert_eq!(parse_qstat_state("garbage\n"), None);
    }

    #[test]
    fn create_carries_resources() {
        let rp = PbsBackend
            .create(serde_json::json!({
                "command": "./run.sh",
                "queue": "batch",
                "wall_time": "02:00:00",
                "processors": 8,
            }))
            .unwrap();
        let parsed = open_rp(&rp).unwrap();
        assert_eq!(parsed.queue.as_deref(), Some("batch"));
        assert_eq!(parsed.processors, Some(8));
        assert!(parsed.running.is_none());
    }

    #[test]
    fn create_rejects_empty_command() {
        assert!(PbsBackend.create(serde_json::json!({"command": ""})).is_err());
    }
}
