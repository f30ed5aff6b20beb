// src/protocol.rs

//! JSON message types of the API surface.
//!
//! Submissions arrive as [`TargetSpec`]s: like a [`Target`] but without
//! history, with the build process given as a backend name plus a creation
//! config (the backend turns that into opaque run parameters), and with an
//! optional pre-assigned id so batches can reference their own members.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::BackendRegistry;
use crate::host::Host;
use crate::target::{BuildProcess, Condition, Equivalence, Target, TargetId};

/// Client-side description of a build process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildSpec {
    NoOperation,
    LongRunning {
        backend: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

impl Default for BuildSpec {
    fn default() -> Self {
        BuildSpec::NoOperation
    }
}

/// One target as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Pre-assigned id (`gf-<uuid>`); minted server-side when absent.
    #[serde(default)]
    pub id: Option<TargetId>,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<TargetId>,
    #[serde(default)]
    pub make_fail_if: Vec<TargetId>,
    #[serde(default)]
    pub success_triggers: Vec<TargetId>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub equivalence: Equivalence,
    #[serde(default)]
    pub build: BuildSpec,
    /// Host specification, e.g. `"localhost"` or `"ssh://user@node:22"`.
    #[serde(default)]
    pub host: Option<String>,
    /// Activate right after submission.
    #[serde(default)]
    pub active: bool,
}

impl TargetSpec {
    /// Resolve the spec into a persistable target. The backend's `create`
    /// turns the client config into run parameters.
    pub fn into_target(self, registry: &BackendRegistry) -> Result<Target, String> {
        let host = match &self.host {
            Some(spec) => Host::from_str(spec)?,
            None => Host::Localhost,
        };

        let build_process = match self.build {
            BuildSpec::NoOperation => BuildProcess::NoOperation,
            BuildSpec::LongRunning { backend, config } => {
                let plugin = registry
                    .get(&backend)
                    .ok_or_else(|| format!("no such backend: {backend}"))?;
                let run_parameters = plugin.create(config)?;
                BuildProcess::LongRunning {
                    backend,
                    run_parameters,
                }
            }
        };

        let mut target = Target::new(self.name, host, build_process);
        if let Some(id) = self.id {
            if !id.starts_with("gf-") {
                return Err(format!("pre-assigned ids must start with \"gf-\": {id}"));
            }
            target.id = id;
        }
        target.tags = self.tags;
        target.metadata = self.metadata;
        target.depends_on = self.depends_on;
        target.make_fail_if = self.make_fail_if;
        target.success_triggers = self.success_triggers;
        target.condition = self.condition;
        target.equivalence = self.equivalence;
        Ok(target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub targets: Vec<TargetSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub ids: Vec<TargetId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Filter expression in the s-expression language.
    pub filter: String,
}

/// Compact view of a target for query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSummary {
    pub id: TargetId,
    pub name: String,
    pub state: String,
    pub simple_state: crate::target::SimpleState,
    pub tags: BTreeSet<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TargetSummary {
    pub fn of(target: &Target) -> Self {
        Self {
            id: target.id.clone(),
            name: target.name.clone(),
            state: target.state().name().to_string(),
            simple_state: target.simple_state(),
            tags: target.tags.clone(),
            created_at: target.created_at(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub summaries: Vec<TargetSummary>,
}

/// Body of `kill`, `restart` and `activate` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<TargetId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_resolves_against_builtin_registry() {
        let registry = BackendRegistry::builtin();
        let spec = TargetSpec {
            id: None,
            name: "t".to_string(),
            tags: BTreeSet::new(),
            metadata: serde_json::Value::Null,
            depends_on: vec![],
            make_fail_if: vec![],
            success_triggers: vec![],
            condition: None,
            equivalence: Equivalence::None,
            build: BuildSpec::LongRunning {
                backend: "process".to_string(),
                config: serde_json::json!({"command": "echo hi"}),
            },
            host: Some("localhost".to_string()),
            active: false,
        };
        let target = spec.into_target(&registry).unwrap();
        assert_eq!(target.backend_name(), Some("process"));
        assert!(target.run_parameters().is_some());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let registry = BackendRegistry::builtin();
        let spec = TargetSpec {
            id: None,
            name: "t".to_string(),
            tags: BTreeSet::new(),
            metadata: serde_json::Value::Null,
            depends_on: vec![],
            make_fail_if: vec![],
            success_triggers: vec![],
            condition: None,
            equivalence: Equivalence::None,
            build: BuildSpec::LongRunning {
                backend: "slurm".to_string(),
                config: serde_json::json!({"command": "x"}),
            },
            host: None,
            active: false,
        };
        assert!(spec.into_target(&registry).is_err());
    }

    #[test]
    fn preassigned_ids_are_validated() {
        let registry = BackendRegistry::builtin();
        let mut spec = TargetSpec {
            id: Some("my-own-id".to_string()),
            name: "t".to_string(),
            tags: BTreeSet::new(),
            metadata: serde_json::Value::Null,
            depends_on: vec![],
            make_fail_if: vec![],
            success_triggers: vec![],
            condition: None,
            equivalence: Equivalence::None,
            build: BuildSpec::NoOperation,
            host: None,
            active: false,
        };
        assert!(spec.clone().into_target(&registry).is_err());
        spec.id = Some("gf-mine".to_string());
        assert_eq!(spec.into_target(&registry).unwrap().id, "gf-mine");
    }
}
