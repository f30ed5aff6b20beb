// tests/store_recovery.rs

//! Crash recovery: an engine reopened over the same store must pick up
//! exactly where the previous one stopped.

mod common;

use common::{engine_in, init_tracing, run_until_settled, run_until_state};

use gridflow::engine::Command;
use gridflow::target::State;
use gridflow_test_utils::{FakePoll, TargetBuilder};

#[tokio::test]
async fn running_targets_resume_polling_after_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    // First engine: drive the target into the running family, then die.
    let history_before = {
        let (mut engine, fake) = engine_in(dir.path()).await;
        fake.script_polls("R", vec![FakePoll::Running; 60]);

        let t = TargetBuilder::new("survivor").id("gf-r").fake_job("R").build();
        engine.submit(vec![t]).await.unwrap();
        engine
            .enqueue(&Command::Activate("gf-r".to_string()))
            .await
            .unwrap();
        run_until_state(&mut engine, "gf-r", 50, |s| *s == State::StillBuilding).await;

        engine.store().get("gf-r").await.unwrap().history
        // Engine dropped here: the "crash".
    };

    // Second engine over the same store; its fake has no script, so the
    // next poll reports success.
    let (mut engine, _fake) = engine_in(dir.path()).await;
    let resumed = engine.store().get("gf-r").await.unwrap();
    assert_eq!(*resumed.state(), State::StillBuilding, "state survived");
    assert_eq!(resumed.history, history_before, "no history was lost");

    run_until_settled(&mut engine, &["gf-r"], 50).await;
    let finished = engine.store().get("gf-r").await.unwrap();
    assert_eq!(*finished.state(), State::RanSuccessfully);

    // The old history is a strict prefix of the new one.
    assert!(finished.history.len() > history_before.len());
    assert_eq!(&finished.history[..history_before.len()], &history_before[..]);
}

#[tokio::test]
async fn queued_commands_survive_a_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    {
        let (mut engine, _fake) = engine_in(dir.path()).await;
        let t = TargetBuilder::new("later").id("gf-l").fake_job("L").build();
        engine.submit(vec![t]).await.unwrap();
        // Enqueued but never ticked: the command must survive the crash.
        engine
            .enqueue(&Command::Activate("gf-l".to_string()))
            .await
            .unwrap();
    }

    let (mut engine, fake) = engine_in(dir.path()).await;
    run_until_settled(&mut engine, &["gf-l"], 50).await;
    assert_eq!(
        *engine.store().get("gf-l").await.unwrap().state(),
        State::RanSuccessfully
    );
    assert_eq!(fake.start_count("L"), 1);
}

#[tokio::test]
async fn recovery_scan_rebuilds_indices_from_scratch() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    {
        let (mut engine, _fake) = engine_in(dir.path()).await;
        let done = TargetBuilder::new("done").id("gf-done").build();
        let waiting = TargetBuilder::new("waiting").id("gf-wait").build();
        engine.submit(vec![done, waiting]).await.unwrap();
        engine
            .enqueue(&Command::Activate("gf-done".to_string()))
            .await
            .unwrap();
        run_until_settled(&mut engine, &["gf-done"], 50).await;
    }

    // Wipe the advisory indices; the scan must rebuild them.
    std::fs::remove_dir_all(dir.path().join("indices")).unwrap();

    let (engine, _fake) = engine_in(dir.path()).await;
    let indices = engine.store().load_indices().await.unwrap();
    assert!(indices.finished_ids.contains("gf-done"));
    assert!(indices.passive_ids.contains("gf-wait"));
}
