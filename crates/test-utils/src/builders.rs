#![allow(dead_code)]

use gridflow::host::Host;
use gridflow::target::{BuildProcess, Condition, Equivalence, Target};

use crate::fake_backend::FakeBackend;

/// Builder for `Target` to simplify test setup.
pub struct TargetBuilder {
    target: Target,
}

impl TargetBuilder {
    /// A no-operation target on localhost.
    pub fn new(name: &str) -> Self {
        Self {
            target: Target::new(name, Host::Localhost, BuildProcess::NoOperation),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.target.id = id.to_string();
        self
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.target.depends_on.push(id.to_string());
        self
    }

    pub fn make_fail_if(mut self, id: &str) -> Self {
        self.target.make_fail_if.push(id.to_string());
        self
    }

    pub fn success_trigger(mut self, id: &str) -> Self {
        self.target.success_triggers.push(id.to_string());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.target.tags.insert(tag.to_string());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.target.condition = Some(condition);
        self
    }

    pub fn equivalence(mut self, equivalence: Equivalence) -> Self {
        self.target.equivalence = equivalence;
        self
    }

    pub fn host(mut self, host: Host) -> Self {
        self.target.host = host;
        self
    }

    /// A job on the [`FakeBackend`], identified by `key`.
    pub fn fake_job(mut self, key: &str) -> Self {
        self.target.build_process = BuildProcess::LongRunning {
            backend: FakeBackend::NAME.to_string(),
            run_parameters: FakeBackend::fresh_rp(key),
        };
        self
    }

    /// A real daemonized process via the `process` backend.
    pub fn process_job(mut self, command: &str, playground_root: &std::path::Path) -> Self {
        let backend = gridflow::backend::process::ProcessBackend::default();
        let rp = gridflow::backend::Backend::create(
            &backend,
            serde_json::json!({
                "command": command,
                "playground_root": playground_root,
            }),
        )
        .expect("process backend config");
        self.target.build_process = BuildProcess::LongRunning {
            backend: "process".to_string(),
            run_parameters: rp,
        };
        self
    }

    pub fn build(self) -> Target {
        self.target
    }
}
