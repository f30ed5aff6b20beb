// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gridflow::backend::BackendRegistry;
use gridflow::config::EngineSection;
use gridflow::engine::Engine;
use gridflow_test_utils::FakeBackend;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub struct TestRig {
    pub engine: Engine,
    pub fake: Arc<FakeBackend>,
    // Held so the store directory outlives the engine.
    pub dir: tempfile::TempDir,
}

/// Engine on a fresh tempdir store with the fake backend registered and
/// backoff shortened so recoverable-start tests settle quickly.
pub async fn fresh_rig() -> TestRig {
    let dir = tempfile::tempdir().unwrap();
    let (engine, fake) = engine_in(dir.path()).await;
    TestRig { engine, fake, dir }
}

/// Open (or reopen) an engine over an existing store directory.
pub async fn engine_in(db_root: &std::path::Path) -> (Engine, Arc<FakeBackend>) {
    let fake = Arc::new(FakeBackend::default());
    let mut registry = BackendRegistry::builtin();
    registry.register(fake.clone());

    let config = EngineSection {
        db_root: db_root.to_path_buf(),
        idle_delay_ms: 10,
        backoff_base_ms: 1,
        backoff_cap_ms: 20,
        ..Default::default()
    };
    let engine = Engine::new(config, registry).await.unwrap();
    (engine, fake)
}

/// Step until every listed target is terminal; panics if they never settle.
pub async fn run_until_settled(engine: &mut Engine, ids: &[&str], max_ticks: usize) {
    for _ in 0..max_ticks {
        engine.step().await.unwrap();

        let mut all_terminal = true;
        for id in ids {
            let target = engine.store().get(id).await.unwrap();
            if !target.state().is_terminal() {
                all_terminal = false;
            }
        }
        if all_terminal {
            return;
        }
        // Leave room for backoff gates and daemonized processes.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("targets did not settle within {max_ticks} ticks: {ids:?}");
}

/// Step until `id` reaches a state satisfying `pred`.
pub async fn run_until_state(
    engine: &mut Engine,
    id: &str,
    max_ticks: usize,
    pred: impl Fn(&gridflow::target::State) -> bool,
) {
    for _ in 0..max_ticks {
        engine.step().await.unwrap();
        let target = engine.store().get(id).await.unwrap();
        if pred(target.state()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("target {id} never reached the expected state");
}
