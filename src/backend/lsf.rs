// src/backend/lsf.rs

//! LSF backend: `bsub` / `bjobs` / `bkill`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::script::{
    last_verdict, parse_monitor_log, render_script, Playground, Verdict,
};
use crate::backend::process::classify_start_error;
use crate::backend::{rp_open, rp_wrap, Backend, KillOutcome, PollOutcome, StartOutcome};
use crate::host::{shell_quote, Host, HostError};

pub const RP_VERSION: u32 = 1;

fn default_playground_root() -> PathBuf {
    PathBuf::from("/tmp/gridflow")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LsfRp {
    command: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    queue: Option<String>,
    #[serde(default)]
    processors: Option<u32>,
    #[serde(default = "default_playground_root")]
    playground_root: PathBuf,
    #[serde(default)]
    running: Option<LsfRunning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LsfRunning {
    playground: Playground,
    job_id: String,
    script: String,
}

#[derive(Debug, Default)]
pub struct LsfBackend;

#[async_trait]
impl Backend for LsfBackend {
    fn name(&self) -> &'static str {
        "lsf"
    }

    fn create(&self, config: serde_json::Value) -> Result<serde_json::Value, String> {
        let rp: LsfRp =
            serde_json::from_value(config).map_err(|e| format!("lsf backend config: {e}"))?;
        if rp.command.trim().is_empty() {
            return Err("lsf backend config: empty command".to_string());
        }
        serde_json::to_value(&rp)
            .map(|payload| rp_wrap(RP_VERSION, payload))
            .map_err(|e| e.to_string())
    }

    async fn start(&self, rp: &serde_json::Value, host: &Host) -> StartOutcome {
        let mut rp: LsfRp = match open_rp(rp) {
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

        // bsub reads the job script on stdin.
        let mut submit = format!(
            "bsub -J {name} -o {stdout} -e {stderr}",
            name = shell_quote(rp.name.as_deref().unwrap_or("gridflow")),
            stdout = shell_quote(&playground.stdout_path().to_string_lossy()),
            stderr = shell_quote(&playground.stderr_path().to_string_lossy()),
        );
        if let Some(queue) = &rp.queue {
            submit.push_str(&format!(" -q {}", shell_quote(queue)));
        }
        if let Some(processors) = rp.processors {
            submit.push_str(&format!(" -n {processors}"));
        }
        submit.push_str(&format!(
            " < {}",
            shell_quote(&playground.script_path().to_string_lossy())
        ));

        let out = match host.run_command(&submit).await {
            Ok(out) => out,
            Err(e) => return classify_start_error(e),
        };
        if out.exit != 0 {
            return StartOutcome::Recoverable(format!(
                "bsub exited {}: {}",
                out.exit,
                out.stderr.trim()
            ));
        }

        // Output shape: Job <1234> is submitted to queue <normal>.
        let job_id = match parse_bsub_job_id(&out.stdout) {
            Some(job_id) => job_id,
            None => {
                return StartOutcome::Fatal(format!(
                    "bsub exited 0 with unparseable output: {:?}",
                    out.stdout.trim()
                ))
            }
        };

        debug!(%job_id, playground = %playground.root.display(), "lsf job submitted");
        rp.running = Some(LsfRunning {
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
        let parsed: LsfRp = match open_rp(rp) {
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

        let still_running = match bjobs_running(host, &running.job_id).await {
            Ok(still_running) => still_running,
            Err(reason) => return PollOutcome::TryAgain(reason),
        };

        if still_running {
            return PollOutcome::StillRunning(rp.clone());
        }

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

    async fn kill(&self, rp: &serde_json::Value, host: &Host) -> KillOutcome {
        let parsed: LsfRp = match open_rp(rp) {
            Ok(parsed) => parsed,
            Err(_) => return KillOutcome::Killed,
        };
        let running = match &parsed.running {
            Some(running) => running,
            None => return KillOutcome::Killed,
        };

        let argv = vec!["bkill".to_string(), running.job_id.clone()];
        match host.execute(&argv).await {
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
        let parsed: LsfRp = open_rp(rp)?;
        let running = parsed
            .running
            .as_ref()
            .ok_or_else(|| "job has not started".to_string())?;

        let path = match item {
            "stdout" => running.playground.stdout_path(),
            "stderr" => running.playground.stderr_path(),
            "log" => running.playground.log_path(),
            "script" => return Ok(running.script.clone().into_bytes()),
            "bjobs" => {
                let argv = vec![
                    "bjobs".to_string(),
                    "-l".to_string(),
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
            "bjobs".to_string(),
            "long bjobs record for the job".to_string(),
        ));
        queries
    }
}

fn open_rp(rp: &serde_json::Value) -> Result<LsfRp, String> {
    let payload = rp_open(rp, RP_VERSION)?;
    serde_json::from_value(payload.clone()).map_err(|e| format!("lsf run parameters: {e}"))
}

async fn read_verdict(host: &Host, running: &LsfRunning) -> Result<Option<Verdict>, String> {
    match host.get_file(&running.playground.log_path()).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(last_verdict(&parse_monitor_log(&text)))
        }
        Err(HostError::MissingFile(_)) => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

/// `Job <1234> is submitted ...` → `1234`.
fn parse_bsub_job_id(stdout: &str) -> Option<String> {
    let start = stdout.find("Job <")? + "Job <".len();
    let rest = &stdout[start..];
    let end = rest.find('>')?;
    let id = &rest[..end];
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(id.to_string())
}

/// True while bjobs reports a live state.
async fn bjobs_running(host: &Host, job_id: &str) -> Result<bool, String> {
    let argv = vec![
        "bjobs".to_string(),
        "-noheader".to_string(),
        "-o".to_string(),
        "stat".to_string(),
        job_id.to_string(),
    ];
    let out = match host.execute(&argv).await {
        Ok(out) => out,
        Err(HostError::Unreachable(reason)) => return Err(reason),
        Err(e) => return Err(e.to_string()),
    };

    // bjobs exits nonzero (or prints "not found") once the job ages out.
    if out.exit != 0 {
        return Ok(false);
    }
    let stat = out.stdout.trim().to_uppercase();
    Ok(matches!(
        stat.as_str(),
        "PEND" | "RUN" | "PSUSP" | "USUSP" | "SSUSP" | "WAIT" | "PROV"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bsub_output_parsing() {
        assert_eq!(
            parse_bsub_job_id("Job <4519> is submitted to queue <normal>.\n"),
            Some("4519".to_string())
        );
        assert_eq!(parse_bsub_job_id("Job <> is submitted"), None);
        assert_eq!(parse_bsub_job_id("no job here"), None);
        assert_eq!(parse_bsub_job_id("Job <abc> is submitted"), None);
    }

    #[test]
    fn create_rejects_empty_command() {
        assert!(LsfBackend.create(serde_json::json!({"command": " "})).is_err());
    }
}
