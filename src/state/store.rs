//! Lock-protected, crash-safe record storage.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::error::StateError;
use crate::state::{EnvironmentId, EnvironmentRecord, StatePaths, default_state_dir};
use crate::tempfiles::{InterruptState, TempFileRegistry};

/// Configuration for [`EnvironmentStateStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root of the state directory.
    pub state_dir: PathBuf,
    /// Remove staging files of dead processes when the store is opened.
    pub sweep_stale_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            sweep_stale_on_open: true,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration using `state_dir`.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sweep_stale_on_open(mut self, sweep: bool) -> Self {
        self.sweep_stale_on_open = sweep;
        self
    }
}

/// How a lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Holds a per-id advisory lock until dropped.
#[derive(Debug)]
struct IdLock {
    file: File,
}

impl Drop for IdLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Stores one [`EnvironmentRecord`] per environment id.
///
/// Every access to an id takes that id's advisory lock: shared for reads,
/// exclusive for writes. Different ids never contend.
///
/// Writes stage the new record in a registry-tracked file in the same
/// directory, fsync it and rename it over the old one, so readers see
/// either the old or the new record.
#[derive(Debug, Clone)]
pub struct EnvironmentStateStore {
    paths: StatePaths,
    registry: Arc<TempFileRegistry>,
    interrupt: Arc<InterruptState>,
}

impl EnvironmentStateStore {
    /// Opens (and if needed creates) the state directory, using the global
    /// temp-file registry and interrupt state.
    pub fn open(config: StoreConfig) -> Result<Self, StateError> {
        Self::open_with(config, TempFileRegistry::global(), InterruptState::global())
    }

    /// Opens the store with explicit collaborators.
    #[instrument(skip_all, fields(state_dir = %config.state_dir.display()))]
    pub fn open_with(
        config: StoreConfig,
        registry: Arc<TempFileRegistry>,
        interrupt: Arc<InterruptState>,
    ) -> Result<Self, StateError> {
        let paths = StatePaths::new(&config.state_dir);
        paths.create_directories()?;

        if config.sweep_stale_on_open {
            match registry.sweep_stale(&paths.environments) {
                Ok(removed) if !removed.is_empty() => {
                    debug!(count = removed.len(), "Removed stale staging files");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to remove stale staging files"),
            }
        }

        Ok(Self {
            paths,
            registry,
            interrupt,
        })
    }

    /// The directory layout in use.
    #[must_use]
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Loads the record for `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupt` if the file cannot be parsed or belongs
    /// to another id.
    #[instrument(skip(self), fields(%id))]
    pub fn load(&self, id: &EnvironmentId) -> Result<Option<EnvironmentRecord>, StateError> {
        let _lock = self.lock(id, LockMode::Shared)?;
        self.read(id)
    }

    /// Loads the record for `id`, failing with `StateError::NotFound` if absent.
    pub fn get(&self, id: &EnvironmentId) -> Result<EnvironmentRecord, StateError> {
        self.load(id)?.ok_or_else(|| StateError::NotFound { id: id.to_string() })
    }

    /// Writes `record` unconditionally, exactly as given.
    ///
    /// Prefer [`compare_and_swap`](Self::compare_and_swap) for anything that
    /// read the record first.
    #[instrument(skip(self, record), fields(id = %record.id, version = record.version))]
    pub fn save(&self, record: &EnvironmentRecord) -> Result<(), StateError> {
        let _lock = self.lock(&record.id, LockMode::Exclusive)?;
        self.write(record)
    }

    /// Replaces the record for `id` if its stored version is `expected_version`.
    ///
    /// `None` means "no record may exist yet". On success the stored record
    /// has `version = expected + 1` (1 for a new record) and a fresh
    /// `updated_at`; it is returned.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Conflict` if the stored version differs.
    #[instrument(skip(self, new_record), fields(%id, expected = ?expected_version))]
    pub fn compare_and_swap(
        &self,
        id: &EnvironmentId,
        expected_version: Option<u64>,
        mut new_record: EnvironmentRecord,
    ) -> Result<EnvironmentRecord, StateError> {
        if &new_record.id != id {
            return Err(StateError::InvalidId {
                id: new_record.id.to_string(),
                reason: format!("record does not belong to {id}"),
            });
        }

        let _lock = self.lock(id, LockMode::Exclusive)?;
        let found = self.read(id)?.map(|r| r.version);
        if found != expected_version {
            debug!(?found, "Version mismatch");
            return Err(StateError::Conflict {
                id: id.to_string(),
                detail: format!(
                    "expected {}, found {}",
                    describe_version(expected_version),
                    describe_version(found)
                ),
            });
        }

        new_record.version = expected_version.map_or(1, |v| v + 1);
        new_record.touch();
        self.write(&new_record)?;
        trace!(version = new_record.version, "Record swapped");
        Ok(new_record)
    }

    /// Deletes the record for `id`.
    ///
    /// With `Some(version)`, only deletes if the stored version matches.
    /// Returns whether a record existed.
    #[instrument(skip(self), fields(%id))]
    pub fn remove(
        &self,
        id: &EnvironmentId,
        expected_version: Option<u64>,
    ) -> Result<bool, StateError> {
        let _lock = self.lock(id, LockMode::Exclusive)?;

        if let Some(expected) = expected_version {
            let found = self.read(id)?.map(|r| r.version);
            if found != Some(expected) {
                return Err(StateError::Conflict {
                    id: id.to_string(),
                    detail: format!(
                        "expected version {expected}, found {}",
                        describe_version(found)
                    ),
                });
            }
        }

        let _section = self.interrupt.critical();
        let path = self.paths.record_file(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.paths.environments)?;
                debug!("Record removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::Io {
                context: format!("failed to remove record: {}", path.display()),
                source: e,
            }),
        }
    }

    /// Ids with a record on disk, sorted.
    pub fn list_ids(&self) -> Result<Vec<EnvironmentId>, StateError> {
        let entries = fs::read_dir(&self.paths.environments).map_err(|e| StateError::Io {
            context: format!(
                "failed to read state directory: {}",
                self.paths.environments.display()
            ),
            source: e,
        })?;

        let mut ids: Vec<EnvironmentId> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let stem = name.to_str()?.strip_suffix(".json")?;
                EnvironmentId::new(stem).ok()
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// All readable records, sorted by id. Corrupt ones are logged and skipped.
    pub fn list(&self) -> Result<Vec<EnvironmentRecord>, StateError> {
        let mut records = Vec::new();
        for id in self.list_ids()? {
            match self.load(&id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(%id, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    fn lock(&self, id: &EnvironmentId, mode: LockMode) -> Result<IdLock, StateError> {
        let path = self.paths.lock_file(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|e| StateError::Io {
                context: format!("failed to open lock file: {}", path.display()),
                source: e,
            })?;

        let locked = match mode {
            LockMode::Shared => fs2::FileExt::lock_shared(&file),
            LockMode::Exclusive => fs2::FileExt::lock_exclusive(&file),
        };
        locked.map_err(|e| StateError::Io {
            context: format!("failed to lock {}", path.display()),
            source: e,
        })?;
        trace!(?mode, "Acquired lock");
        Ok(IdLock { file })
    }

    /// Reads a record. Caller holds the lock.
    fn read(&self, id: &EnvironmentId) -> Result<Option<EnvironmentRecord>, StateError> {
        let path = self.paths.record_file(id);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Io {
                    context: format!("failed to read record: {}", path.display()),
                    source: e,
                });
            }
        };

        let record: EnvironmentRecord =
            serde_json::from_slice(&content).map_err(|e| StateError::Corrupt {
                path: path.clone(),
                reason: format!("failed to parse record JSON: {e}"),
            })?;

        if &record.id != id {
            return Err(StateError::Corrupt {
                path,
                reason: format!("record id mismatch: expected {id}, got {}", record.id),
            });
        }
        Ok(Some(record))
    }

    /// Atomically replaces the record file. Caller holds the exclusive lock.
    fn write(&self, record: &EnvironmentRecord) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(record).map_err(|e| StateError::Io {
            context: format!("failed to serialize record {}", record.id),
            source: std::io::Error::new(ErrorKind::InvalidData, e),
        })?;

        // An interrupt waits for this to finish.
        let _section = self.interrupt.critical();

        let staging = self
            .registry
            .create_temp_file_in(&self.paths.environments, "record")?;
        let target = self.paths.record_file(&record.id);

        if let Err(e) = write_and_rename(&staging, &target, &json) {
            if let Err(cleanup) = fs::remove_file(&staging) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging file");
                }
            }
            self.registry.untrack(&staging);
            return Err(e);
        }

        // The staging path no longer exists; it is the record now.
        self.registry.untrack(&staging);
        sync_dir(&self.paths.environments)
    }
}

fn write_and_rename(staging: &Path, target: &Path, content: &[u8]) -> Result<(), StateError> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(staging)
        .map_err(|e| StateError::Io {
            context: format!("failed to open staging file: {}", staging.display()),
            source: e,
        })?;

    file.write_all(content).map_err(|e| StateError::Io {
        context: format!("failed to write staging file: {}", staging.display()),
        source: e,
    })?;

    file.sync_all().map_err(|e| StateError::Io {
        context: "failed to sync staging file".to_string(),
        source: e,
    })?;

    fs::rename(staging, target).map_err(|e| StateError::Io {
        context: format!(
            "failed to rename {} to {}",
            staging.display(),
            target.display()
        ),
        source: e,
    })
}

/// Makes a rename or unlink in `dir` durable.
fn sync_dir(dir: &Path) -> Result<(), StateError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StateError::Io {
            context: format!("failed to sync directory: {}", dir.display()),
            source: e,
        })
}

fn describe_version(version: Option<u64>) -> String {
    match version {
        Some(v) => format!("version {v}"),
        None => "no record".to_string(),
    }
}
