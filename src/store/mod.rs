// src/store/mod.rs

//! Durable key-value store for targets.
//!
//! Layout under the configured root:
//!
//! ```text
//! <db_root>/targets/<id>.json    versioned envelope {version, payload}
//! <db_root>/indices/*.json       advisory indices, rebuildable by scan
//! <db_root>/commands.log         append-only command pipe log
//! ```
//!
//! Every write goes through temp-file + rename with fsync, so a crash never
//! leaves a half-written record. Updates are compare-and-set keyed by the
//! expected history length; that is how lost updates between the engine loop
//! and out-of-band commands are detected.

pub mod indices;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::target::{Target, TargetId};

pub use indices::Indices;

/// Current version of the target envelope.
///
/// Version 1 predates the `kill_requested` flag; the migration chain
/// upgrades such records in place on first read.
pub const ENVELOPE_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {id} has unknown future envelope version {version} (this build reads up to {ENVELOPE_VERSION})")]
    UnknownVersion { id: String, version: u32 },

    #[error("target already exists: {0}")]
    AlreadyExists(String),

    #[error("target not found: {0}")]
    NotFound(String),

    #[error("concurrent modification of {id}: expected history length {expected}, found {found}")]
    CasMismatch {
        id: String,
        expected: usize,
        found: usize,
    },
}

/// Versioned on-disk wrapper around a serialized target.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    payload: serde_json::Value,
}

/// Migration step: upgrade a payload from `from` to `from + 1`.
struct Migration {
    from: u32,
    upgrade: fn(serde_json::Value) -> serde_json::Value,
}

/// Registered chain; index order must follow version order.
static MIGRATIONS: &[Migration] = &[Migration {
    from: 1,
    upgrade: migrate_v1_add_kill_requested,
}];

/// v1 records predate the out-of-band kill flag.
fn migrate_v1_add_kill_requested(mut payload: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.entry("kill_requested")
            .or_insert(serde_json::Value::Bool(false));
    }
    payload
}

/// Result of the startup recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub indices: Indices,
    /// Targets in a Running-family state that must resume polling.
    pub running: Vec<TargetId>,
    /// Records that failed to parse and were skipped.
    pub skipped: Vec<TargetId>,
}

/// Filesystem-backed target store.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    targets_dir: PathBuf,
    indices_dir: PathBuf,
}

impl Store {
    /// Open (creating directories if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let targets_dir = root.join("targets");
        let indices_dir = root.join("indices");
        tokio::fs::create_dir_all(&targets_dir).await?;
        tokio::fs::create_dir_all(&indices_dir).await?;
        debug!(root = %root.display(), "store opened");
        Ok(Self {
            root,
            targets_dir,
            indices_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn commands_log_path(&self) -> PathBuf {
        self.root.join("commands.log")
    }

    fn target_path(&self, id: &str) -> PathBuf {
        self.targets_dir.join(format!("{id}.json"))
    }

    /// Insert a fresh target; fails if the id is already present.
    pub async fn create(&self, target: &Target) -> Result<(), StoreError> {
        let path = self.target_path(&target.id);
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists(target.id.clone()));
        }
        self.write_record(target).await
    }

    /// Fetch a target; `NotFound` if absent.
    pub async fn get(&self, id: &str) -> Result<Target, StoreError> {
        self.maybe_get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Fetch a target if present.
    pub async fn maybe_get(&self, id: &str) -> Result<Option<Target>, StoreError> {
        let path = self.target_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                id: id.to_string(),
                source,
            })?;

        let (payload, upgraded) = upgrade_payload(id, envelope)?;
        let target: Target =
            serde_json::from_value(payload).map_err(|source| StoreError::Corrupt {
                id: id.to_string(),
                source,
            })?;

        if upgraded {
            info!(id, "upgraded target envelope in place");
            self.write_record(&target).await?;
        }

        Ok(Some(target))
    }

    /// Compare-and-set update.
    ///
    /// `expected_history_len` is the history length the caller observed when
    /// it fetched the target; a mismatch means someone else wrote in between.
    pub async fn update_cas(
        &self,
        target: &Target,
        expected_history_len: usize,
    ) -> Result<(), StoreError> {
        let current = self.get(&target.id).await?;
        if current.history.len() != expected_history_len {
            return Err(StoreError::CasMismatch {
                id: target.id.clone(),
                expected: expected_history_len,
                found: current.history.len(),
            });
        }
        self.write_record(target).await
    }

    /// Multi-key write with CAS preconditions checked up front.
    ///
    /// All records are staged to temporary files (fsynced), then renamed into
    /// place in caller order. Callers order entries so that a crash between
    /// renames is recoverable by re-running the producing transition (e.g.
    /// activated children before the parent's Succeeded write).
    pub async fn write_batch(
        &self,
        entries: &[(Target, usize)],
    ) -> Result<(), StoreError> {
        for (target, expected) in entries {
            let current = self.get(&target.id).await?;
            if current.history.len() != *expected {
                return Err(StoreError::CasMismatch {
                    id: target.id.clone(),
                    expected: *expected,
                    found: current.history.len(),
                });
            }
        }

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(entries.len());
        for (target, _) in entries {
            let path = self.target_path(&target.id);
            let tmp = self.stage_record(target).await?;
            staged.push((tmp, path));
        }
        for (tmp, path) in staged {
            tokio::fs::rename(&tmp, &path).await?;
        }
        sync_dir(&self.targets_dir)?;
        Ok(())
    }

    /// All target ids currently on disk.
    pub async fn list_ids(&self) -> Result<Vec<TargetId>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.targets_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Full scan: rebuild indices and find Running-family targets that must
    /// be re-ingested into the engine's work set.
    pub async fn recovery_scan(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();

        for id in self.list_ids().await? {
            let target = match self.maybe_get(&id).await {
                Ok(Some(target)) => target,
                Ok(None) => continue,
                Err(StoreError::Corrupt { id, source }) => {
                    warn!(%id, error = %source, "skipping corrupt record during recovery scan");
                    report.skipped.push(id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            report.indices.note(&target);
            if target.state().is_running_family() {
                report.running.push(target.id.clone());
            }
        }

        self.save_indices(&report.indices).await?;
        info!(
            active = report.indices.active_ids.len(),
            passive = report.indices.passive_ids.len(),
            finished = report.indices.finished_ids.len(),
            running = report.running.len(),
            "recovery scan complete"
        );
        Ok(report)
    }

    /// Persist the advisory indices.
    pub async fn save_indices(&self, indices: &Indices) -> Result<(), StoreError> {
        let sets: [(&str, &std::collections::BTreeSet<TargetId>); 3] = [
            ("active_ids", &indices.active_ids),
            ("passive_ids", &indices.passive_ids),
            ("finished_ids", &indices.finished_ids),
        ];
        for (name, set) in sets {
            let bytes = serde_json::to_vec_pretty(set).map_err(|source| StoreError::Corrupt {
                id: name.to_string(),
                source,
            })?;
            write_durable(&self.indices_dir.join(format!("{name}.json")), &bytes).await?;
        }
        let bytes = serde_json::to_vec_pretty(&indices.pointer_map).map_err(|source| {
            StoreError::Corrupt {
                id: "pointer_map".to_string(),
                source,
            }
        })?;
        write_durable(&self.indices_dir.join("pointer_map.json"), &bytes).await?;
        Ok(())
    }

    /// Load the advisory indices; missing files yield empty sets.
    pub async fn load_indices(&self) -> Result<Indices, StoreError> {
        let mut indices = Indices::default();

        for (name, set) in [
            ("active_ids", &mut indices.active_ids),
            ("passive_ids", &mut indices.passive_ids),
            ("finished_ids", &mut indices.finished_ids),
        ] {
            let path = self.indices_dir.join(format!("{name}.json"));
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    *set = serde_json::from_slice(&bytes).map_err(|source| {
                        StoreError::Corrupt {
                            id: name.to_string(),
                            source,
                        }
                    })?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let path = self.indices_dir.join("pointer_map.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                indices.pointer_map =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        id: "pointer_map".to_string(),
                        source,
                    })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(indices)
    }

    async fn write_record(&self, target: &Target) -> Result<(), StoreError> {
        let tmp = self.stage_record(target).await?;
        let path = self.target_path(&target.id);
        tokio::fs::rename(&tmp, &path).await?;
        sync_dir(&self.targets_dir)?;
        Ok(())
    }

    /// Serialize + write the envelope to a temp file, fsynced, and return
    /// the temp path.
    async fn stage_record(&self, target: &Target) -> Result<PathBuf, StoreError> {
        let payload = serde_json::to_value(target).map_err(|source| StoreError::Corrupt {
            id: target.id.clone(),
            source,
        })?;
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(|source| StoreError::Corrupt {
            id: target.id.clone(),
            source,
        })?;

        let tmp = self
            .targets_dir
            .join(format!("{}.json.tmp-{}", target.id, std::process::id()));
        write_file_synced(&tmp, &bytes).await?;
        Ok(tmp)
    }
}

/// Run the migration chain up to the current version.
///
/// Returns the upgraded payload and whether any step ran.
fn upgrade_payload(
    id: &str,
    envelope: Envelope,
) -> Result<(serde_json::Value, bool), StoreError> {
    if envelope.version > ENVELOPE_VERSION {
        return Err(StoreError::UnknownVersion {
            id: id.to_string(),
            version: envelope.version,
        });
    }
    if envelope.version == ENVELOPE_VERSION {
        return Ok((envelope.payload, false));
    }

    let mut version = envelope.version;
    let mut payload = envelope.payload;
    while version < ENVELOPE_VERSION {
        let step = MIGRATIONS.iter().find(|m| m.from == version).ok_or(
            // A gap in the chain means this build cannot read the record.
            StoreError::UnknownVersion {
                id: id.to_string(),
                version,
            },
        )?;
        payload = (step.upgrade)(payload);
        version += 1;
    }
    Ok((payload, true))
}

/// Write bytes to `path` and fsync the file.
async fn write_file_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Temp-file + rename + directory fsync.
async fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    write_file_synced(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Fsync a directory so renames inside it are durable.
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::target::{BuildProcess, State};

    async fn fresh_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn sample(name: &str) -> Target {
        Target::new(name, Host::Localhost, BuildProcess::NoOperation)
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let (_dir, store) = fresh_store().await;
        let t = sample("a");

        store.create(&t).await.unwrap();
        let back = store.get(&t.id).await.unwrap();
        assert_eq!(back.id, t.id);
        assert_eq!(back.history, t.history);

        assert!(matches!(
            store.create(&t).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.get("gf-missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cas_detects_lost_updates() {
        let (_dir, store) = fresh_store().await;
        let mut t = sample("a");
        store.create(&t).await.unwrap();

        let observed = t.history.len();
        t.push_state(State::Active { by_user: true });
        store.update_cas(&t, observed).await.unwrap();

        // A second writer with the stale length must be rejected.
        let mut stale = store.get(&t.id).await.unwrap();
        stale.push_state(State::Killed);
        let err = store.update_cas(&stale, observed).await.unwrap_err();
        assert!(matches!(err, StoreError::CasMismatch { .. }));
    }

    #[tokio::test]
    async fn batch_write_checks_all_preconditions_first() {
        let (_dir, store) = fresh_store().await;
        let mut a = sample("a");
        let mut b = sample("b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let len_a = a.history.len();
        let len_b = b.history.len();
        a.push_state(State::Active { by_user: false });
        b.push_state(State::RanSuccessfully);

        store
            .write_batch(&[(a.clone(), len_a), (b.clone(), len_b)])
            .await
            .unwrap();
        assert_eq!(*store.get(&a.id).await.unwrap().state(), State::Active { by_user: false });

        // A stale precondition on any entry fails the whole batch before
        // any rename happens.
        let mut a2 = store.get(&a.id).await.unwrap();
        a2.push_state(State::Killed);
        let err = store
            .write_batch(&[(a2, len_a)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CasMismatch { .. }));
        assert_eq!(
            *store.get(&a.id).await.unwrap().state(),
            State::Active { by_user: false }
        );
    }

    #[tokio::test]
    async fn v1_records_are_upgraded_in_place() {
        let (_dir, store) = fresh_store().await;
        let t = sample("old");

        // Hand-write a version-1 envelope (no kill_requested field).
        let mut payload = serde_json::to_value(&t).unwrap();
        payload.as_object_mut().unwrap().remove("kill_requested");
        let envelope = serde_json::json!({ "version": 1, "payload": payload });
        std::fs::write(
            store.target_path(&t.id),
            serde_json::to_vec(&envelope).unwrap(),
        )
        .unwrap();

        let back = store.get(&t.id).await.unwrap();
        assert!(!back.kill_requested);

        // The upgrade was written back.
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.target_path(&t.id)).unwrap()).unwrap();
        assert_eq!(raw["version"], ENVELOPE_VERSION);
    }

    #[tokio::test]
    async fn future_versions_are_fatal() {
        let (_dir, store) = fresh_store().await;
        let envelope = serde_json::json!({ "version": 99, "payload": {} });
        std::fs::write(
            store.target_path("gf-future"),
            serde_json::to_vec(&envelope).unwrap(),
        )
        .unwrap();

        let err = store.get("gf-future").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownVersion { version: 99, .. }));
    }

    #[tokio::test]
    async fn recovery_scan_classifies_and_rebuilds() {
        let (_dir, store) = fresh_store().await;

        let passive = sample("p");
        let mut active = sample("a");
        active.push_state(State::Active { by_user: true });
        let mut running = sample("r");
        running.push_state(State::Active { by_user: true });
        running.push_state(State::TriedToStart { attempt: 1 });
        running.push_state(State::StartedRunning);
        let mut done = sample("d");
        done.push_state(State::RanSuccessfully);

        for t in [&passive, &active, &running, &done] {
            store.create(t).await.unwrap();
        }

        let report = store.recovery_scan().await.unwrap();
        assert!(report.indices.passive_ids.contains(&passive.id));
        assert!(report.indices.active_ids.contains(&active.id));
        assert!(report.indices.active_ids.contains(&running.id));
        assert!(report.indices.finished_ids.contains(&done.id));
        assert_eq!(report.running, vec![running.id.clone()]);

        // Indices were persisted and can be loaded back.
        let loaded = store.load_indices().await.unwrap();
        assert_eq!(loaded.active_ids, report.indices.active_ids);
    }
}
