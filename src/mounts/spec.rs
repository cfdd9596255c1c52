//! User-facing mount specifications.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MountSpecError;

/// Directory host paths land under when no target is given.
pub const DEFAULT_TARGET_ROOT: &str = "/workspace";

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountPermission {
    /// Read-only (`ro`).
    #[serde(rename = "ro")]
    ReadOnly,
    /// Read-write (`rw`).
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
}

impl MountPermission {
    /// True for [`MountPermission::ReadOnly`].
    #[must_use]
    pub fn is_read_only(self) -> bool {
        self == Self::ReadOnly
    }
}

impl fmt::Display for MountPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "ro"),
            Self::ReadWrite => write!(f, "rw"),
        }
    }
}

impl FromStr for MountPermission {
    type Err = MountSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ro" | "readonly" | "read-only" => Ok(Self::ReadOnly),
            "rw" | "readwrite" | "read-write" => Ok(Self::ReadWrite),
            _ => Err(MountSpecError {
                input: s.to_string(),
                reason: "permission must be 'ro' or 'rw'".to_string(),
            }),
        }
    }
}

/// What the user asked to mount, before any validation.
///
/// `source` is the host path as typed; `target` is the path inside the
/// container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub permission: MountPermission,
}

impl MountSpec {
    /// A spec with an explicit target.
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        permission: MountPermission,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            permission,
        }
    }

    /// A spec whose target is `/workspace/<basename of source>`.
    pub fn with_default_target(source: impl Into<PathBuf>, permission: MountPermission) -> Self {
        let source = source.into();
        let target = default_target(&source);
        Self {
            source,
            target,
            permission,
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.source.display(),
            self.target.display(),
            self.permission
        )
    }
}

/// Parses `source`, `source:perm`, `source:/target` or `source:/target:perm`.
///
/// ```
/// use tempenv::mounts::{MountPermission, MountSpec};
///
/// let spec: MountSpec = "/home/dev/app:/src:ro".parse().unwrap();
/// assert_eq!(spec.target.to_str(), Some("/src"));
/// assert_eq!(spec.permission, MountPermission::ReadOnly);
///
/// let spec: MountSpec = "/home/dev/app".parse().unwrap();
/// assert_eq!(spec.target.to_str(), Some("/workspace/app"));
/// ```
impl FromStr for MountSpec {
    type Err = MountSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| MountSpecError {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split(':').collect();
        if parts[0].is_empty() {
            return Err(invalid("source is empty"));
        }

        let permission = |p: &str| {
            p.parse::<MountPermission>()
                .map_err(|e| invalid(&e.reason))
        };

        match parts.as_slice() {
            [source] => Ok(Self::with_default_target(*source, MountPermission::default())),
            [source, second] if second.starts_with('/') => {
                Ok(Self::new(*source, *second, MountPermission::default()))
            }
            [source, perm] => Ok(Self::with_default_target(*source, permission(*perm)?)),
            [_, "", _] => Err(invalid("target is empty")),
            [source, target, perm] => Ok(Self::new(*source, *target, permission(*perm)?)),
            _ => Err(invalid(
                "expected 'source', 'source:perm', 'source:target' or 'source:target:perm'",
            )),
        }
    }
}

fn default_target(source: &Path) -> PathBuf {
    let root = PathBuf::from(DEFAULT_TARGET_ROOT);
    match source.file_name() {
        Some(name) => root.join(name),
        None => root,
    }
}
