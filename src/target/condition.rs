// src/target/condition.rs

//! Success conditions: predicates evaluated on a host.
//!
//! A condition serves two purposes: skipping work that is already done
//! (checked on activation) and verifying that a finished job actually
//! produced its artifact (checked after the backend reports completion).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::host::{shell_quote, Host, HostError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Always holds.
    Always,
    /// Never holds.
    Never,
    /// A path exists on the host.
    VolumeExists { path: PathBuf },
    /// A command exits with the given code.
    CommandReturns { cmd: String, value: i32 },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    /// Evaluate the predicate on `host`.
    ///
    /// Only transport failures error; a predicate that cleanly evaluates to
    /// false is `Ok(false)`.
    pub fn eval<'a>(
        &'a self,
        host: &'a Host,
    ) -> Pin<Box<dyn Future<Output = Result<bool, HostError>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Condition::Always => Ok(true),
                Condition::Never => Ok(false),
                Condition::VolumeExists { path } => {
                    let cmd = format!("test -e {}", shell_quote(&path.to_string_lossy()));
                    let out = host.run_command(&cmd).await?;
                    Ok(out.exit == 0)
                }
                Condition::CommandReturns { cmd, value } => {
                    let out = host.run_command(cmd).await?;
                    Ok(out.exit == *value)
                }
                Condition::And { conditions } => {
                    for c in conditions {
                        if !c.eval(host).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Condition::Or { conditions } => {
                    for c in conditions {
                        if c.eval(host).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Condition::Not { condition } => Ok(!condition.eval(host).await?),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boolean_structure() {
        let host = Host::Localhost;
        let t = Condition::Always;
        let f = Condition::Never;

        assert!(t.eval(&host).await.unwrap());
        assert!(!f.eval(&host).await.unwrap());

        let and = Condition::And {
            conditions: vec![Condition::Always, Condition::Never],
        };
        assert!(!and.eval(&host).await.unwrap());

        let or = Condition::Or {
            conditions: vec![Condition::Never, Condition::Always],
        };
        assert!(or.eval(&host).await.unwrap());

        let not = Condition::Not {
            condition: Box::new(Condition::Never),
        };
        assert!(not.eval(&host).await.unwrap());
    }

    #[tokio::test]
    async fn volume_exists_checks_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("made");
        std::fs::write(&present, b"x").unwrap();

        let host = Host::Localhost;
        let holds = Condition::VolumeExists {
            path: present.clone(),
        };
        assert!(holds.eval(&host).await.unwrap());

        let missing = Condition::VolumeExists {
            path: dir.path().join("not-made"),
        };
        assert!(!missing.eval(&host).await.unwrap());
    }

    #[tokio::test]
    async fn command_returns_compares_exit_codes() {
        let host = Host::Localhost;
        let c = Condition::CommandReturns {
            cmd: "exit 4".to_string(),
            value: 4,
        };
        assert!(c.eval(&host).await.unwrap());

        let c = Condition::CommandReturns {
            cmd: "true".to_string(),
            value: 1,
        };
        assert!(!c.eval(&host).await.unwrap());
    }
}
