//! Filesystem layout for environment state.
//!
//! This module manages the state directory structure, including creation
//! and permission checks of the directories records and locks live in.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::StateError;
use crate::state::EnvironmentId;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Paths of the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    /// State root (`$XDG_DATA_HOME/tempenv` by default).
    pub root: PathBuf,
    /// One `{id}.json` per environment, plus in-flight staging files.
    pub environments: PathBuf,
    /// One `{id}.lock` per environment.
    pub locks: PathBuf,
}

impl StatePaths {
    /// Computes the layout under `root`. Does not touch the filesystem.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            environments: root.join("environments"),
            locks: root.join("locks"),
            root: root.to_path_buf(),
        }
    }

    /// Path of the record file for `id`.
    #[must_use]
    pub fn record_file(&self, id: &EnvironmentId) -> PathBuf {
        self.environments.join(format!("{id}.json"))
    }

    /// Path of the lock file for `id`.
    #[must_use]
    pub fn lock_file(&self, id: &EnvironmentId) -> PathBuf {
        self.locks.join(format!("{id}.lock"))
    }

    /// Creates the root, environments and locks directories (0700).
    ///
    /// # Errors
    ///
    /// Returns `StateError::Io` if directory creation fails.
    pub fn create_directories(&self) -> Result<(), StateError> {
        for dir in [&self.root, &self.environments, &self.locks] {
            ensure_state_dir(dir)?;
        }
        Ok(())
    }
}

/// Returns the default state directory.
///
/// Uses `XDG_DATA_HOME` if set, otherwise `~/.local/share/tempenv`, and
/// `/tmp/tempenv` as a last resort.
#[must_use]
pub fn default_state_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        if !xdg_data.is_empty() {
            return PathBuf::from(xdg_data).join("tempenv");
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/tempenv");
    }

    PathBuf::from("/tmp/tempenv")
}

/// Ensures `dir` exists and is private to the owner.
///
/// Existing directories with looser permissions are tightened.
///
/// # Errors
///
/// Returns `StateError::Io` if creation or the permission change fails.
pub fn ensure_state_dir(dir: &Path) -> Result<(), StateError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| StateError::Io {
            context: format!("failed to create directory: {}", dir.display()),
            source: e,
        })?;
    }

    let metadata = fs::metadata(dir).map_err(|e| StateError::Io {
        context: format!("failed to read metadata for: {}", dir.display()),
        source: e,
    })?;
    if metadata.permissions().mode() & 0o777 != DIR_PERMISSIONS {
        fs::set_permissions(dir, fs::Permissions::from_mode(DIR_PERMISSIONS)).map_err(|e| {
            StateError::Io {
                context: format!("failed to set permissions on: {}", dir.display()),
                source: e,
            }
        })?;
    }
    Ok(())
}
