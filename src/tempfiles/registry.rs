//! Tracked temporary files and directories.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, instrument, trace, warn};
use walkdir::WalkDir;

use crate::error::RegistryError;

/// Every name created by the registry starts with this, followed by the
/// creating process id and a dash.
pub const TEMP_PREFIX: &str = ".tempenv-";

/// File permissions: owner read/write only (0600).
const FILE_PERMISSIONS: u32 = 0o600;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// What a tracked path is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TempKind {
    File,
    Directory,
}

impl std::fmt::Display for TempKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// One tracked temporary path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedTempEntry {
    pub path: PathBuf,
    pub kind: TempKind,
    pub owner_process_id: u32,
}

/// Outcome of a successful sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Paths deleted by this sweep.
    pub removed: Vec<PathBuf>,
    /// Tracked paths that were already gone.
    pub already_missing: Vec<PathBuf>,
}

impl SweepReport {
    /// True if the sweep had nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.already_missing.is_empty()
    }
}

/// Process-wide set of temporary paths that must not outlive the process.
///
/// Creation and registration happen under the same lock as [`sweep`], so a
/// path is never observed half-created. Names carry the creating process id
/// ([`TEMP_PREFIX`]`{pid}-`), which lets [`sweep_stale`] clean up after a
/// process that died before it could sweep.
///
/// [`sweep`]: TempFileRegistry::sweep
/// [`sweep_stale`]: TempFileRegistry::sweep_stale
#[derive(Debug)]
pub struct TempFileRegistry {
    default_dir: PathBuf,
    entries: Mutex<BTreeMap<PathBuf, TrackedTempEntry>>,
}

impl Default for TempFileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TempFileRegistry {
    /// Creates an empty registry that creates paths in the system temp directory.
    #[must_use]
    pub fn new() -> Self {
        Self::with_dir(std::env::temp_dir())
    }

    /// Creates an empty registry with a different default directory.
    #[must_use]
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: dir.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// The registry shared by the whole process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<TempFileRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Directory used when no directory is given.
    #[must_use]
    pub fn default_dir(&self) -> &Path {
        &self.default_dir
    }

    /// Creates a 0600 file in the default directory and tracks it.
    pub fn create_temp_file(&self, template: &str) -> Result<PathBuf, RegistryError> {
        self.create_temp_file_in(&self.default_dir, template)
    }

    /// Creates a 0600 file in `dir` and tracks it.
    ///
    /// The returned path is already registered.
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub fn create_temp_file_in(&self, dir: &Path, template: &str) -> Result<PathBuf, RegistryError> {
        let prefix = name_prefix(template);
        let mut entries = self.lock();

        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .permissions(fs::Permissions::from_mode(FILE_PERMISSIONS))
            .tempfile_in(dir)
            .map_err(|e| RegistryError::CreateFailed {
                kind: "file",
                dir: dir.to_path_buf(),
                source: e,
            })?;
        let (_, path) = file.keep().map_err(|e| RegistryError::CreateFailed {
            kind: "file",
            dir: dir.to_path_buf(),
            source: e.error,
        })?;

        trace!(path = %path.display(), "Created temp file");
        entries.insert(path.clone(), entry(&path, TempKind::File));
        Ok(path)
    }

    /// Creates a 0700 directory in the default directory and tracks it.
    pub fn create_temp_dir(&self, template: &str) -> Result<PathBuf, RegistryError> {
        self.create_temp_dir_in(&self.default_dir, template)
    }

    /// Creates a 0700 directory in `dir` and tracks it.
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub fn create_temp_dir_in(&self, dir: &Path, template: &str) -> Result<PathBuf, RegistryError> {
        let prefix = name_prefix(template);
        let mut entries = self.lock();

        let created = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(dir)
            .map_err(|e| RegistryError::CreateFailed {
                kind: "directory",
                dir: dir.to_path_buf(),
                source: e,
            })?;
        let path = created.keep();

        // Tracked before the chmod so a failure here still gets swept.
        entries.insert(path.clone(), entry(&path, TempKind::Directory));
        fs::set_permissions(&path, fs::Permissions::from_mode(DIR_PERMISSIONS)).map_err(|e| {
            RegistryError::CreateFailed {
                kind: "directory",
                dir: dir.to_path_buf(),
                source: e,
            }
        })?;

        trace!(path = %path.display(), "Created temp directory");
        Ok(path)
    }

    /// Stops tracking `path` without deleting it.
    ///
    /// Returns the entry if it was tracked.
    pub fn untrack(&self, path: &Path) -> Option<TrackedTempEntry> {
        let removed = self.lock().remove(path);
        if removed.is_some() {
            trace!(path = %path.display(), "Untracked temp path");
        }
        removed
    }

    /// True if `path` is tracked.
    #[must_use]
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    /// Snapshot of all tracked entries.
    #[must_use]
    pub fn tracked(&self) -> Vec<TrackedTempEntry> {
        self.lock().values().cloned().collect()
    }

    /// Deletes every tracked path and empties the registry.
    ///
    /// Missing paths count as deleted. A path that cannot be deleted is logged,
    /// dropped from the registry, and reported in `RegistryError::SweepPartial`
    /// after all other paths have been attempted. Calling this again right
    /// away is a no-op.
    pub fn sweep(&self) -> Result<SweepReport, RegistryError> {
        let mut entries = self.lock();
        let mut report = SweepReport::default();
        let mut failed = Vec::new();

        while let Some((path, tracked)) = entries.pop_first() {
            match remove_entry(&path, tracked.kind) {
                Ok(true) => report.removed.push(path),
                Ok(false) => report.already_missing.push(path),
                Err(e) => {
                    warn!(path = %path.display(), kind = %tracked.kind, error = %e, "Failed to remove temp path");
                    failed.push(path);
                }
            }
        }

        if !report.is_empty() {
            debug!(
                removed = report.removed.len(),
                missing = report.already_missing.len(),
                "Swept temp paths"
            );
        }

        if failed.is_empty() {
            Ok(report)
        } else {
            Err(RegistryError::SweepPartial { failed })
        }
    }

    /// Removes registry-named entries in `dir` whose creating process is gone.
    ///
    /// This covers a process killed between creating a path and sweeping it.
    /// Entries of live processes (including this one) are left alone.
    /// Returns the paths removed. Like [`sweep`](Self::sweep), every entry is
    /// attempted; the ones that could not be removed are reported together
    /// in `RegistryError::SweepPartial`.
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub fn sweep_stale(&self, dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
        sweep_stale_with(dir, remove_entry)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PathBuf, TrackedTempEntry>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sweep_stale_with(
    dir: &Path,
    remove: impl Fn(&Path, TempKind) -> std::io::Result<bool>,
) -> Result<Vec<PathBuf>, RegistryError> {
    let mut removed = Vec::new();
    let mut failed = Vec::new();
    let own_pid = std::process::id();

    for dirent in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        let Some(pid) = dirent.file_name().to_str().and_then(owner_pid) else {
            continue;
        };
        if pid == own_pid || process_exists(pid) {
            continue;
        }

        let kind = if dirent.file_type().is_dir() {
            TempKind::Directory
        } else {
            TempKind::File
        };
        match remove(dirent.path(), kind) {
            Ok(_) => {
                debug!(path = %dirent.path().display(), pid, "Removed stale temp path");
                removed.push(dirent.path().to_path_buf());
            }
            Err(e) => {
                warn!(path = %dirent.path().display(), pid, error = %e, "Failed to remove stale temp path");
                failed.push(dirent.path().to_path_buf());
            }
        }
    }

    if failed.is_empty() {
        Ok(removed)
    } else {
        Err(RegistryError::SweepPartial { failed })
    }
}

fn name_prefix(template: &str) -> String {
    let template: String = template
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{TEMP_PREFIX}{}-{template}-", std::process::id())
}

fn entry(path: &Path, kind: TempKind) -> TrackedTempEntry {
    TrackedTempEntry {
        path: path.to_path_buf(),
        kind,
        owner_process_id: std::process::id(),
    }
}

/// Ok(true) if removed, Ok(false) if it was already gone.
fn remove_entry(path: &Path, kind: TempKind) -> std::io::Result<bool> {
    let result = match kind {
        TempKind::File => fs::remove_file(path),
        TempKind::Directory => fs::remove_dir_all(path),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Parses the creating pid out of a registry-made file name.
fn owner_pid(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(TEMP_PREFIX)?;
    let (pid, _) = rest.split_once('-')?;
    pid.parse().ok()
}

/// Checks whether a process exists. EPERM means it exists but belongs to
/// someone else.
pub(crate) fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("tempenv-registry-test")
            .join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&dir).expect("failed to create scratch dir");
        dir
    }

    #[test]
    fn test_file_is_tracked_with_owner_only_mode() {
        let dir = scratch();
        let registry = TempFileRegistry::with_dir(&dir);

        let path = registry.create_temp_file("state").expect("create file");
        assert!(path.exists());
        assert!(registry.is_tracked(&path));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(owner_pid(name), Some(std::process::id()));

        registry.sweep().unwrap();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_dir_is_tracked_with_owner_only_mode() {
        let dir = scratch();
        let registry = TempFileRegistry::with_dir(&dir);

        let path = registry.create_temp_dir("work").expect("create dir");
        assert!(path.is_dir());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        registry.sweep().unwrap();
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_untrack_keeps_file() {
        let dir = scratch();
        let registry = TempFileRegistry::with_dir(&dir);
        let path = registry.create_temp_file("keep").unwrap();

        let entry = registry.untrack(&path).expect("was tracked");
        assert_eq!(entry.kind, TempKind::File);
        assert!(registry.untrack(&path).is_none());

        registry.sweep().unwrap();
        assert!(path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sweep_tolerates_missing() {
        let dir = scratch();
        let registry = TempFileRegistry::with_dir(&dir);
        let path = registry.create_temp_file("gone").unwrap();
        fs::remove_file(&path).unwrap();

        let report = registry.sweep().expect("missing path is not an error");
        assert_eq!(report.already_missing, vec![path]);
        assert!(registry.tracked().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_template_is_sanitised() {
        let prefix = name_prefix("a/b c");
        assert!(prefix.starts_with(TEMP_PREFIX));
        assert!(prefix.ends_with("-a_b_c-"));
    }

    #[test]
    fn test_owner_pid_parsing() {
        assert_eq!(owner_pid(".tempenv-42-state-abc.tmp"), Some(42));
        assert_eq!(owner_pid(".tempenv-x-state"), None);
        assert_eq!(owner_pid("state.json"), None);
    }

    #[test]
    fn test_sweep_stale_attempts_every_entry() {
        let dir = scratch();
        let dead = 4_194_305;
        let stuck = dir.join(format!("{TEMP_PREFIX}{dead}-a-1.tmp"));
        let first = dir.join(format!("{TEMP_PREFIX}{dead}-b-2.tmp"));
        let second = dir.join(format!("{TEMP_PREFIX}{dead}-c-3.tmp"));
        for path in [&stuck, &first, &second] {
            fs::write(path, b"x").unwrap();
        }

        let err = sweep_stale_with(&dir, |path, kind| {
            if path == stuck {
                Err(std::io::Error::from(ErrorKind::PermissionDenied))
            } else {
                remove_entry(path, kind)
            }
        })
        .unwrap_err();

        assert!(matches!(&err, RegistryError::SweepPartial { failed } if *failed == vec![stuck.clone()]));
        assert!(stuck.exists());
        assert!(!first.exists());
        assert!(!second.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_process_exists() {
        assert!(process_exists(std::process::id()));
    }
}
