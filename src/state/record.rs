//! The persisted environment record.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mounts::{MountPermission, MountSpec, ValidatedMount};
use crate::state::EnvironmentId;
use crate::tempfiles::process_exists;

/// Where an environment is in its lifecycle.
///
/// ```text
/// (absent) -> provisioning -> running <-> stopped
/// running | stopped -> provisioning            (recreate for a mount change)
/// provisioning -> stopped                      (recreate of a stopped environment)
/// provisioning | running | stopped | failed -> destroying -> destroyed
/// provisioning | destroying -> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    /// Resources are being created (or recreated).
    Provisioning,
    /// The container is up.
    Running,
    /// The container exists but is stopped.
    Stopped,
    /// Resources are being torn down.
    Destroying,
    /// Everything is gone; the record is about to be deleted.
    Destroyed,
    /// An operation failed; see the record's `failure`.
    Failed,
}

impl EnvironmentStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use EnvironmentStatus::{Destroyed, Destroying, Failed, Provisioning, Running, Stopped};

        if self == next {
            return self != Destroyed;
        }
        matches!(
            (self, next),
            (Provisioning, Running | Stopped | Failed | Destroying)
                | (Running, Stopped | Provisioning | Destroying)
                | (Stopped, Running | Provisioning | Destroying)
                | (Failed | Destroying, Destroying | Destroyed | Failed)
        ) && !(self == Failed && next == Destroyed)
    }

    /// True while an operation is half-way and the record describes how far it got.
    #[must_use]
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Provisioning | Self::Destroying)
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A bind mount as stored in the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountEntry {
    /// Canonical host path at the time of validation.
    pub source: PathBuf,
    pub target: PathBuf,
    pub permission: MountPermission,
}

impl MountEntry {
    /// The spec that reproduces this entry.
    #[must_use]
    pub fn to_spec(&self) -> MountSpec {
        MountSpec::new(self.source.clone(), self.target.clone(), self.permission)
    }
}

impl From<&ValidatedMount> for MountEntry {
    fn from(mount: &ValidatedMount) -> Self {
        Self {
            source: mount.source_canonical.as_path().to_path_buf(),
            target: mount.target.clone(),
            permission: mount.permission,
        }
    }
}

/// A named engine volume the environment owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub name: String,
    pub target: PathBuf,
}

/// Why the environment ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub reason: String,
    /// Engine resources that could not be cleaned up (e.g. `container:tempenv-demo`).
    #[serde(default)]
    pub leftover_resources: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Operations that claim a record while they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    UpdateMounts,
    Start,
    Stop,
    Restart,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::UpdateMounts => write!(f, "update mounts of"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Restart => write!(f, "restart"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// Marker left on a record by the process currently acting on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub operation: Operation,
    pub owner_pid: u32,
    /// Distinguishes two claims by the same process.
    pub claim: Uuid,
    pub started_at: DateTime<Utc>,
}

impl PendingOperation {
    /// A claim by the current process.
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            owner_pid: std::process::id(),
            claim: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    /// True if the owning process is gone (and the claim can be taken over).
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        !process_exists(self.owner_pid)
    }
}

/// Everything tempenv knows about one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: EnvironmentId,
    /// Bumped by every successful compare-and-swap; 0 means never stored.
    pub version: u64,
    /// Engine-side name, derived from `id`.
    pub container_name: String,
    /// Engine-assigned identifier, once the container exists.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub container_handle: Option<String>,
    pub image: String,
    pub mounts: Vec<MountEntry>,
    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
    pub status: EnvironmentStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<FailureInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pending: Option<PendingOperation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentRecord {
    /// A fresh, never-stored record in `Provisioning`.
    #[must_use]
    pub fn new(
        id: EnvironmentId,
        container_name: impl Into<String>,
        image: impl Into<String>,
        mounts: Vec<MountEntry>,
        volumes: Vec<VolumeEntry>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: 0,
            container_name: container_name.into(),
            container_handle: None,
            image: image.into(),
            mounts,
            volumes,
            status: EnvironmentStatus::Provisioning,
            failure: None,
            pending: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Updates `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Records a failure and moves to `Failed`.
    pub fn mark_failed(&mut self, reason: impl Into<String>, leftover: Vec<String>) {
        self.status = EnvironmentStatus::Failed;
        self.pending = None;
        self.failure = Some(FailureInfo {
            reason: reason.into(),
            leftover_resources: leftover,
            at: Utc::now(),
        });
    }

    /// True if `mounts` is the same list, in the same order.
    #[must_use]
    pub fn has_mounts(&self, mounts: &[MountEntry]) -> bool {
        self.mounts == mounts
    }

    /// True if an operation whose process is still alive holds a claim.
    ///
    /// Claims made by this process count too: two threads must not both
    /// act on one environment.
    #[must_use]
    pub fn has_live_claim(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| !p.is_abandoned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnvironmentStatus::{Destroyed, Destroying, Failed, Provisioning, Running, Stopped};

    fn record() -> EnvironmentRecord {
        EnvironmentRecord::new(
            EnvironmentId::new("demo").unwrap(),
            "tempenv-demo",
            "ubuntu:24.04",
            vec![MountEntry {
                source: PathBuf::from("/tmp/a"),
                target: PathBuf::from("/work"),
                permission: MountPermission::ReadWrite,
            }],
            vec![VolumeEntry {
                name: "tempenv-demo-cache".to_string(),
                target: PathBuf::from("/home/developer/.cache"),
            }],
        )
    }

    #[test]
    fn test_transitions() {
        assert!(Provisioning.can_transition_to(Running));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Provisioning.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Provisioning));
        assert!(Failed.can_transition_to(Destroying));
        assert!(Destroying.can_transition_to(Destroyed));
        assert!(Destroying.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));

        assert!(!Destroyed.can_transition_to(Destroyed));
        assert!(!Destroyed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Destroyed));
        assert!(!Destroying.can_transition_to(Running));
        assert!(!Provisioning.can_transition_to(Destroyed));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Provisioning.to_string(), "provisioning");
        assert_eq!(Destroyed.to_string(), "destroyed");
        assert_eq!(
            serde_json::to_string(&Stopped).unwrap(),
            "\"stopped\""
        );
    }

    #[test]
    fn test_new_record() {
        let r = record();
        assert_eq!(r.version, 0);
        assert_eq!(r.status, Provisioning);
        assert!(r.container_handle.is_none());
        assert!(r.pending.is_none());
        assert_eq!(r.created_at, r.updated_at);
    }

    #[test]
    fn test_mark_failed() {
        let mut r = record();
        r.pending = Some(PendingOperation::new(Operation::Create));
        r.mark_failed("engine exploded", vec!["container:tempenv-demo".to_string()]);

        assert_eq!(r.status, Failed);
        assert!(r.pending.is_none());
        let failure = r.failure.unwrap();
        assert_eq!(failure.reason, "engine exploded");
        assert_eq!(failure.leftover_resources.len(), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let mut r = record();
        r.container_handle = Some("abc123".to_string());
        r.pending = Some(PendingOperation::new(Operation::UpdateMounts));

        let json = serde_json::to_string_pretty(&r).unwrap();
        let back: EnvironmentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_live_claim() {
        let mut r = record();
        assert!(!r.has_live_claim());
        r.pending = Some(PendingOperation::new(Operation::Create));
        assert!(r.has_live_claim());

        // not a valid pid
        r.pending.as_mut().unwrap().owner_pid = u32::MAX;
        assert!(!r.has_live_claim());
    }
}
