// src/host/mod.rs

//! Host abstraction: where commands run and files live.
//!
//! A [`Host`] is a plain value (serializable, comparable) naming an execution
//! location. The capability set is deliberately small — run a command, put a
//! file, get a file, ensure a directory — because that is everything the
//! engine and the backends need.
//!
//! Transport failures (connection refused, ssh exiting 255) surface as
//! [`HostError::Unreachable`]; a nonzero exit of the *remote command* is not
//! an error, it is data in the returned [`Output`].

pub mod pool;

use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub use pool::SessionPool;

/// Errors from host capabilities.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("filesystem error on host: {0}")]
    Filesystem(String),

    #[error("missing file on host: {0}")]
    MissingFile(String),
}

/// Result of running a command on a host.
///
/// A nonzero `exit` is a normal outcome; only transport failures are errors.
#[derive(Debug, Clone)]
pub struct Output {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A place where commands run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Host {
    /// The machine the engine runs on.
    Localhost,

    /// A machine reached over ssh, optionally through a login node.
    Ssh {
        #[serde(default)]
        user: Option<String>,
        hostname: String,
        #[serde(default)]
        port: Option<u16>,
        /// Extra `-o` options passed verbatim to ssh.
        #[serde(default)]
        options: Vec<String>,
        /// Login node (`user@login.cluster`) to hop through before
        /// reaching `hostname`.
        #[serde(default)]
        via: Option<String>,
    },
}

impl Default for Host {
    fn default() -> Self {
        Host::Localhost
    }
}

impl FromStr for Host {
    type Err = String;

    /// Parse `"localhost"` or `"ssh://[user@]host[:port]"`, with an optional
    /// `?via=user@login` suffix for login-node hops.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty host specification".to_string());
        }
        if s == "localhost" || s == "local" {
            return Ok(Host::Localhost);
        }

        let rest = s
            .strip_prefix("ssh://")
            .ok_or_else(|| format!("unrecognized host specification: {s}"))?;

        let (rest, via) = match rest.split_once("?via=") {
            Some((head, via)) if !via.is_empty() => (head, Some(via.to_string())),
            Some((_, _)) => return Err(format!("empty ?via= in host specification: {s}")),
            None => (rest, None),
        };

        let (user, hostport) = match rest.split_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, rest),
        };

        let (hostname, port) = match hostport.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| format!("invalid ssh port in host specification: {s}"))?;
                (host.to_string(), Some(port))
            }
            None => (hostport.to_string(), None),
        };

        if hostname.is_empty() {
            return Err(format!("missing hostname in host specification: {s}"));
        }

        Ok(Host::Ssh {
            user,
            hostname,
            port,
            options: Vec::new(),
            via,
        })
    }
}

impl Host {
    /// Stable identifier for pooling and log fields.
    pub fn key(&self) -> String {
        match self {
            Host::Localhost => "localhost".to_string(),
            Host::Ssh {
                user,
                hostname,
                port,
                ..
            } => {
                let user = user
                    .as_deref()
                    .map(|u| format!("{u}@"))
                    .unwrap_or_default();
                match port {
                    Some(p) => format!("{user}{hostname}:{p}"),
                    None => format!("{user}{hostname}"),
                }
            }
        }
    }

    /// Run a shell command on this host.
    ///
    /// Never errors on nonzero exit; only transport failure is an error.
    pub async fn run_command(&self, cmd: &str) -> Result<Output, HostError> {
        match self {
            Host::Localhost => {
                let (exit, stdout, stderr) =
                    spawn_collect("sh", &["-c".to_string(), cmd.to_string()], None)
                        .await
                        .map_err(|e| HostError::Unreachable(format!("spawning sh: {e}")))?;
                Ok(text_output(exit, stdout, stderr))
            }
            Host::Ssh { .. } => {
                let mut argv = self.ssh_argv();
                argv.push(cmd.to_string());
                let (exit, stdout, stderr) = spawn_collect("ssh", &argv, None)
                    .await
                    .map_err(|e| HostError::Unreachable(format!("spawning ssh: {e}")))?;
                if exit == 255 {
                    return Err(HostError::Unreachable(String::from_utf8_lossy(&stderr).into_owned()));
                }
                Ok(text_output(exit, stdout, stderr))
            }
        }
    }

    /// Run a command given as an argument vector, for quoting-sensitive
    /// callers. On ssh hosts the vector is re-quoted into a single remote
    /// command line.
    pub async fn execute(&self, argv: &[String]) -> Result<Output, HostError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HostError::Filesystem("empty argument vector".to_string()))?;

        match self {
            Host::Localhost => {
                let (exit, stdout, stderr) = spawn_collect(program, args, None)
                    .await
                    .map_err(|e| HostError::Unreachable(format!("spawning {program}: {e}")))?;
                Ok(text_output(exit, stdout, stderr))
            }
            Host::Ssh { .. } => {
                let quoted = argv
                    .iter()
                    .map(|a| shell_quote(a))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.run_command(&quoted).await
            }
        }
    }

    /// Create a directory (and parents) on this host.
    pub async fn ensure_directory(&self, path: &Path) -> Result<(), HostError> {
        match self {
            Host::Localhost => tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| HostError::Filesystem(format!("mkdir {}: {e}", path.display()))),
            Host::Ssh { .. } => {
                let cmd = format!("mkdir -p {}", shell_quote(&path.to_string_lossy()));
                let out = self.run_command(&cmd).await?;
                if out.exit != 0 {
                    return Err(HostError::Filesystem(format!(
                        "mkdir {} exited {}: {}",
                        path.display(),
                        out.exit,
                        out.stderr.trim()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Write a file on this host, replacing any previous content atomically
    /// (write to a temporary name, then rename onto the final path).
    pub async fn put_file(&self, path: &Path, bytes: &[u8]) -> Result<(), HostError> {
        match self {
            Host::Localhost => {
                let tmp = tmp_sibling(path);
                let mut file = tokio::fs::File::create(&tmp)
                    .await
                    .map_err(|e| HostError::Filesystem(format!("create {}: {e}", tmp.display())))?;
                file.write_all(bytes)
                    .await
                    .map_err(|e| HostError::Filesystem(format!("write {}: {e}", tmp.display())))?;
                file.sync_all()
                    .await
                    .map_err(|e| HostError::Filesystem(format!("fsync {}: {e}", tmp.display())))?;
                drop(file);
                tokio::fs::rename(&tmp, path).await.map_err(|e| {
                    HostError::Filesystem(format!("rename onto {}: {e}", path.display()))
                })
            }
            Host::Ssh { .. } => {
                let final_q = shell_quote(&path.to_string_lossy());
                let tmp_q = shell_quote(&tmp_sibling(path).to_string_lossy());
                let mut argv = self.ssh_argv();
                argv.push(format!("cat > {tmp_q} && mv -- {tmp_q} {final_q}"));
                let (exit, _stdout, stderr) = spawn_collect("ssh", &argv, Some(bytes))
                    .await
                    .map_err(|e| HostError::Unreachable(format!("spawning ssh: {e}")))?;
                if exit == 255 {
                    return Err(HostError::Unreachable(String::from_utf8_lossy(&stderr).into_owned()));
                }
                if exit != 0 {
                    return Err(HostError::Filesystem(format!(
                        "writing {} exited {exit}: {}",
                        path.display(),
                        String::from_utf8_lossy(&stderr).trim()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Read a file from this host.
    pub async fn get_file(&self, path: &Path) -> Result<Vec<u8>, HostError> {
        match self {
            Host::Localhost => match tokio::fs::read(path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(HostError::MissingFile(path.display().to_string()))
                }
                Err(e) => Err(HostError::Filesystem(format!(
                    "read {}: {e}",
                    path.display()
                ))),
            },
            Host::Ssh { .. } => {
                let mut argv = self.ssh_argv();
                argv.push(format!("cat -- {}", shell_quote(&path.to_string_lossy())));
                let (exit, stdout, stderr) = spawn_collect("ssh", &argv, None)
                    .await
                    .map_err(|e| HostError::Unreachable(format!("spawning ssh: {e}")))?;
                if exit == 255 {
                    return Err(HostError::Unreachable(String::from_utf8_lossy(&stderr).into_owned()));
                }
                if exit != 0 {
                    return Err(HostError::MissingFile(path.display().to_string()));
                }
                Ok(stdout)
            }
        }
    }

    /// Argument vector up to (and including) the destination; callers append
    /// the remote command line.
    fn ssh_argv(&self) -> Vec<String> {
        match self {
            Host::Localhost => Vec::new(),
            Host::Ssh {
                user,
                hostname,
                port,
                options,
                via,
            } => {
                let mut argv = vec!["-o".to_string(), "BatchMode=yes".to_string()];
                for opt in options {
                    argv.push("-o".to_string());
                    argv.push(opt.clone());
                }
                if let Some(via) = via {
                    argv.push("-o".to_string());
                    argv.push(format!("ProxyJump={via}"));
                }
                if let Some(port) = port {
                    argv.push("-p".to_string());
                    argv.push(port.to_string());
                }
                match user {
                    Some(user) => argv.push(format!("{user}@{hostname}")),
                    None => argv.push(hostname.clone()),
                }
                argv
            }
        }
    }
}

/// Quote a string for `sh`.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/=:@%+,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Temporary sibling path used for atomic replace.
fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(&format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

fn text_output(exit: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Output {
    Output {
        exit,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

/// Spawn a local process, optionally feeding `stdin_bytes`, and collect its
/// exit code and raw output.
async fn spawn_collect(
    program: &str,
    args: &[String],
    stdin_bytes: Option<&[u8]>,
) -> std::io::Result<(i32, Vec<u8>, Vec<u8>)> {
    debug!(program, ?args, "spawning process");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin_bytes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(bytes) = stdin_bytes {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
        }
    }

    let out = child.wait_with_output().await?;
    Ok((out.status.code().unwrap_or(-1), out.stdout, out.stderr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_localhost() {
        assert_eq!(Host::from_str("localhost").unwrap(), Host::Localhost);
        assert_eq!(Host::from_str("local").unwrap(), Host::Localhost);
    }

    #[test]
    fn parse_ssh_forms() {
        let h = Host::from_str("ssh://deploy@cluster.example:2222").unwrap();
        assert_eq!(
            h,
            Host::Ssh {
                user: Some("deploy".to_string()),
                hostname: "cluster.example".to_string(),
                port: Some(2222),
                options: vec![],
                via: None,
            }
        );
        assert_eq!(h.key(), "deploy@cluster.example:2222");

        let h = Host::from_str("ssh://node7?via=me@login.cluster").unwrap();
        match h {
            Host::Ssh { hostname, via, .. } => {
                assert_eq!(hostname, "node7");
                assert_eq!(via.as_deref(), Some("me@login.cluster"));
            }
            other => panic!("unexpected host: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Host::from_str("").is_err());
        assert!(Host::from_str("ftp://x").is_err());
        assert!(Host::from_str("ssh://user@:22").is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("simple/path_1.log"), "simple/path_1.log");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn localhost_run_command_reports_exit_and_stdout() {
        let out = Host::Localhost.run_command("echo ok; exit 3").await.unwrap();
        assert_eq!(out.exit, 3);
        assert_eq!(out.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn localhost_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let host = Host::Localhost;

        host.put_file(&path, b"payload").await.unwrap();
        let read = host.get_file(&path).await.unwrap();
        assert_eq!(read, b"payload");

        let missing = host.get_file(&dir.path().join("nope")).await;
        assert!(matches!(missing, Err(HostError::MissingFile(_))));
    }
}
