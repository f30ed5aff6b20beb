// tests/pbs_monitored_flow.rs

//! PBS backend against shim scheduler binaries: submission returns the
//! qsub job id, polling trusts qstat while the monitored log is silent,
//! the log's verdict wins as soon as it appears, and a job that vanishes
//! from the queue without a verdict is a failure.
//!
//! Everything lives in one test because the shims are installed by
//! prepending to PATH, which is process-global.

use std::path::Path;

use gridflow::backend::pbs::PbsBackend;
use gridflow::backend::{Backend, KillOutcome, PollOutcome, StartOutcome};
use gridflow::host::Host;

fn write_shim(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Shim qsub/qstat/qdel, driven by files under `state`:
/// - `state/gone` existing makes qstat exit 153 (job aged out)
/// - otherwise qstat prints `state/qstat_output`
/// - qdel appends to `state/qdel_calls`
fn install_scheduler_shims(bin: &Path, state: &Path) {
    write_shim(bin, "qsub", "echo 1234.fakepbs");
    write_shim(
        bin,
        "qstat",
        &format!(
            "[ -f {state}/gone ] && exit 153\ncat {state}/qstat_output",
            state = state.display()
        ),
    );
    write_shim(
        bin,
        "qdel",
        &format!("echo killed >> {}/qdel_calls", state.display()),
    );

    let path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{path}", bin.display()));
}

async fn submit(backend: &PbsBackend, host: &Host, playground_root: &Path) -> serde_json::Value {
    let rp = backend
        .create(serde_json::json!({
            "command": "echo hi",
            "playground_root": playground_root,
        }))
        .unwrap();
    match backend.start(&rp, host).await {
        StartOutcome::Started(rp) => rp,
        other => panic!("start failed: {other:?}"),
    }
}

fn playground_of(rp: &serde_json::Value) -> std::path::PathBuf {
    rp["payload"]["running"]["playground"]["root"]
        .as_str()
        .unwrap()
        .into()
}

#[tokio::test]
async fn monitored_log_and_qstat_drive_the_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    let state = dir.path().join("state");
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::create_dir_all(&state).unwrap();
    install_scheduler_shims(&bin, &state);
    std::fs::write(
        state.join("qstat_output"),
        "Job Id: 1234.fakepbs\n    job_state = R\n",
    )
    .unwrap();

    let backend = PbsBackend::default();
    let host = Host::Localhost;

    // --- Happy path: qstat R, then the log reports success.
    let running_rp = submit(&backend, &host, &dir.path().join("pg1")).await;
    assert_eq!(
        running_rp["payload"]["running"]["job_id"].as_str(),
        Some("1234.fakepbs")
    );

    match backend.update(&running_rp, &host).await {
        PollOutcome::StillRunning(_) => {}
        other => panic!("expected StillRunning, got {other:?}"),
    }

    std::fs::write(
        playground_of(&running_rp).join("monitor.log"),
        "start\nbefore cmd\nafter cmd\nsuccess 1722580000\n",
    )
    .unwrap();
    match backend.update(&running_rp, &host).await {
        PollOutcome::Succeeded(_) => {}
        other => panic!("expected Succeeded, got {other:?}"),
    }

    // Cancel goes through qdel; diagnostic streams are exposed.
    match backend.kill(&running_rp, &host).await {
        KillOutcome::Killed => {}
        other => panic!("expected Killed, got {other:?}"),
    }
    let calls = std::fs::read_to_string(state.join("qdel_calls")).unwrap();
    assert_eq!(calls.lines().count(), 1);

    let script = backend.query(&running_rp, &host, "script").await.unwrap();
    assert!(String::from_utf8_lossy(&script).contains("echo hi"));
    let qstat = backend.query(&running_rp, &host, "qstat").await.unwrap();
    assert!(String::from_utf8_lossy(&qstat).contains("job_state"));
    assert!(backend.query(&running_rp, &host, "bogus").await.is_err());

    // --- A failure verdict in the log beats the scheduler.
    let failed_rp = submit(&backend, &host, &dir.path().join("pg2")).await;
    std::fs::write(
        playground_of(&failed_rp).join("monitor.log"),
        "start\nbefore cmd\nafter cmd\nfailure 1722580070 cmd 2\n",
    )
    .unwrap();
    match backend.update(&failed_rp, &host).await {
        PollOutcome::Failed(_, reason) => assert!(reason.contains("exited 2"), "{reason}"),
        other => panic!("expected Failed, got {other:?}"),
    }

    // --- The job vanishes from the queue without ever writing a verdict.
    let vanished_rp = submit(&backend, &host, &dir.path().join("pg3")).await;
    std::fs::write(state.join("gone"), b"").unwrap();
    match backend.update(&vanished_rp, &host).await {
        PollOutcome::Failed(_, reason) => {
            assert!(reason.contains("without writing a verdict"), "{reason}")
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}
