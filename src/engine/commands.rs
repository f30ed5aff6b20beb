// src/engine/commands.rs

//! The command pipe: a durable, line-oriented side channel.
//!
//! Producers (API handlers, the CLI) append lines to `commands.log` with
//! fsync; the engine drains new lines at the top of each tick and persists
//! its read offset only after the commands have been applied, so a crash
//! replays rather than loses them. Commands are idempotent in effect, which
//! makes the replay harmless.

use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::store::StoreError;
use crate::target::TargetId;

/// A control command, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Wake the engine for one tick (no effect of its own).
    Step,
    Pause,
    Resume,
    Kill(TargetId),
    Restart(TargetId),
    Activate(TargetId),
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("step"), None, _) => Ok(Command::Step),
            (Some("pause"), None, _) => Ok(Command::Pause),
            (Some("resume"), None, _) => Ok(Command::Resume),
            (Some("kill"), Some(id), None) => Ok(Command::Kill(id.to_string())),
            (Some("restart"), Some(id), None) => Ok(Command::Restart(id.to_string())),
            (Some("activate"), Some(id), None) => Ok(Command::Activate(id.to_string())),
            _ => Err(format!("unrecognized command line: {line:?}")),
        }
    }
}

impl Command {
    pub fn to_line(&self) -> String {
        match self {
            Command::Step => "step".to_string(),
            Command::Pause => "pause".to_string(),
            Command::Resume => "resume".to_string(),
            Command::Kill(id) => format!("kill {id}"),
            Command::Restart(id) => format!("restart {id}"),
            Command::Activate(id) => format!("activate {id}"),
        }
    }

    /// Target id named by this command, for tick discovery.
    pub fn names_id(&self) -> Option<&TargetId> {
        match self {
            Command::Kill(id) | Command::Restart(id) | Command::Activate(id) => Some(id),
            _ => None,
        }
    }
}

/// Append a command to the log with fsync. Used by producers; the engine
/// itself only drains.
pub async fn append_command(log_path: &std::path::Path, command: &Command) -> Result<(), StoreError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    file.write_all(format!("{}\n", command.to_line()).as_bytes())
        .await?;
    file.sync_all().await?;
    Ok(())
}

/// The engine's draining side of the pipe.
#[derive(Debug)]
pub struct CommandPipe {
    log_path: PathBuf,
    offset_path: PathBuf,
    offset: u64,
}

impl CommandPipe {
    /// Open the pipe, restoring the persisted drain offset.
    pub async fn open(log_path: PathBuf, offset_path: PathBuf) -> Result<Self, StoreError> {
        let offset = match tokio::fs::read_to_string(&offset_path).await {
            Ok(text) => text.trim().parse().unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            log_path,
            offset_path,
            offset,
        })
    }

    /// Read commands appended since the last committed offset.
    ///
    /// Unparseable lines are logged and skipped. The new offset is returned
    /// and becomes durable only via [`CommandPipe::commit`], after the
    /// caller has applied the commands.
    pub async fn drain(&mut self) -> Result<(Vec<Command>, u64), StoreError> {
        let bytes = match tokio::fs::read(&self.log_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), self.offset))
            }
            Err(e) => return Err(e.into()),
        };

        // A truncated log (operator rotation) restarts the offset.
        let start = if (self.offset as usize) <= bytes.len() {
            self.offset as usize
        } else {
            warn!(
                offset = self.offset,
                len = bytes.len(),
                "command log shrank; rereading from the start"
            );
            0
        };

        let tail = &bytes[start..];
        // Only consume complete lines; a partially-flushed line is left
        // for the next drain.
        let consumed = match tail.iter().rposition(|&b| b == b'\n') {
            Some(last_newline) => last_newline + 1,
            None => 0,
        };

        let mut commands = Vec::new();
        for line in String::from_utf8_lossy(&tail[..consumed]).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(command) => commands.push(command),
                Err(reason) => warn!(%reason, "skipping malformed command"),
            }
        }

        Ok((commands, start as u64 + consumed as u64))
    }

    /// Persist the drain offset after the commands have been applied.
    pub async fn commit(&mut self, offset: u64) -> Result<(), StoreError> {
        if offset == self.offset {
            return Ok(());
        }
        let tmp = self.offset_path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(offset.to_string().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.offset_path).await?;
        self.offset = offset;
        Ok(())
    }
}
