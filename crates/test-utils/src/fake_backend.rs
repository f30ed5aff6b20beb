use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use gridflow::backend::{rp_open, rp_wrap, Backend, KillOutcome, PollOutcome, StartOutcome};
use gridflow::host::Host;

/// Scripted reaction to one `start` attempt.
#[derive(Debug, Clone)]
pub enum FakeStart {
    Recoverable(String),
    Fatal(String),
}

/// Scripted reaction to one `update` poll.
#[derive(Debug, Clone)]
pub enum FakePoll {
    Running,
    Succeed,
    Fail(String),
}

#[derive(Default)]
struct Inner {
    /// Consumed (front first) before a start succeeds.
    start_plan: HashMap<String, VecDeque<FakeStart>>,
    /// Consumed (front first) by polls; empty means `Succeed`.
    poll_plan: HashMap<String, VecDeque<FakePoll>>,
    /// Every `start` invocation, scripted failures included.
    attempts: Vec<String>,
    started: Vec<String>,
    killed: Vec<String>,
}

/// A backend that runs nothing and follows a per-key script.
///
/// Jobs are identified by the `key` inside their run parameters; the fake
/// records every `start` and `kill` so tests can assert at-most-once and
/// idempotence properties.
#[derive(Default)]
pub struct FakeBackend {
    inner: Mutex<Inner>,
}

impl FakeBackend {
    pub const NAME: &'static str = "fake";
    const RP_VERSION: u32 = 1;

    /// Pre-start run parameters for a job named `key`.
    pub fn fresh_rp(key: &str) -> serde_json::Value {
        rp_wrap(
            Self::RP_VERSION,
            serde_json::json!({ "key": key, "running": false }),
        )
    }

    /// Queue reactions for the next `start` attempts of `key`.
    pub fn script_start(&self, key: &str, steps: Vec<FakeStart>) {
        let mut inner = self.inner.lock().unwrap();
        inner.start_plan.entry(key.to_string()).or_default().extend(steps);
    }

    /// Queue reactions for the next polls of `key`.
    pub fn script_polls(&self, key: &str, steps: Vec<FakePoll>) {
        let mut inner = self.inner.lock().unwrap();
        inner.poll_plan.entry(key.to_string()).or_default().extend(steps);
    }

    pub fn started(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn start_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .started
            .iter()
            .filter(|k| *k == key)
            .count()
    }

    /// Start invocations for `key`, scripted failures included.
    pub fn attempt_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .attempts
            .iter()
            .filter(|k| *k == key)
            .count()
    }

    pub fn kill_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .killed
            .iter()
            .filter(|k| *k == key)
            .count()
    }

    fn key_of(rp: &serde_json::Value) -> Result<String, String> {
        let payload = rp_open(rp, Self::RP_VERSION)?;
        payload
            .get("key")
            .and_then(|k| k.as_str())
            .map(str::to_string)
            .ok_or_else(|| "fake run parameters without a key".to_string())
    }

    fn running_rp(key: &str) -> serde_json::Value {
        rp_wrap(
            Self::RP_VERSION,
            serde_json::json!({ "key": key, "running": true }),
        )
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn create(&self, config: serde_json::Value) -> Result<serde_json::Value, String> {
        let key = config
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| "fake backend config needs a key".to_string())?;
        Ok(Self::fresh_rp(key))
    }

    async fn start(&self, rp: &serde_json::Value, _host: &Host) -> StartOutcome {
        let key = match Self::key_of(rp) {
            Ok(key) => key,
            Err(reason) => return StartOutcome::Fatal(reason),
        };

        let mut inner = self.inner.lock().unwrap();
        inner.attempts.push(key.clone());
        if let Some(step) = inner
            .start_plan
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
        {
            return match step {
                FakeStart::Recoverable(reason) => StartOutcome::Recoverable(reason),
                FakeStart::Fatal(reason) => StartOutcome::Fatal(reason),
            };
        }
        inner.started.push(key.clone());
        StartOutcome::Started(Self::running_rp(&key))
    }

    async fn update(&self, rp: &serde_json::Value, _host: &Host) -> PollOutcome {
        let key = match Self::key_of(rp) {
            Ok(key) => key,
            Err(reason) => return PollOutcome::Failed(rp.clone(), reason),
        };

        let mut inner = self.inner.lock().unwrap();
        let step = inner
            .poll_plan
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(FakePoll::Succeed);
        match step {
            FakePoll::Running => PollOutcome::StillRunning(rp.clone()),
            FakePoll::Succeed => PollOutcome::Succeeded(rp.clone()),
            FakePoll::Fail(reason) => PollOutcome::Failed(rp.clone(), reason),
        }
    }

    async fn kill(&self, rp: &serde_json::Value, _host: &Host) -> KillOutcome {
        if let Ok(key) = Self::key_of(rp) {
            self.inner.lock().unwrap().killed.push(key);
        }
        KillOutcome::Killed
    }

    async fn query(
        &self,
        _rp: &serde_json::Value,
        _host: &Host,
        item: &str,
    ) -> Result<Vec<u8>, String> {
        match item {
            "stdout" => Ok(b"fake stdout".to_vec()),
            other => Err(format!("unknown query: {other}")),
        }
    }

    fn additional_queries(&self, _rp: &serde_json::Value) -> Vec<(String, String)> {
        vec![("stdout".to_string(), "canned output".to_string())]
    }
}
