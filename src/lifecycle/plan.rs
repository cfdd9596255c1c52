//! Deciding how a mount change is applied.
//!
//! A change is applied by restarting the existing container only when the
//! engine can swap bind mounts on a stopped container and the change cannot
//! alter what an existing mount shows inside the container. Everything else
//! recreates the container. Concretely, recreate when:
//!
//! - the engine cannot reconfigure mounts in place;
//! - a kept target is rebound (new source or new permission);
//! - the kept mounts change relative order (later mounts shadow earlier ones);
//! - an added or removed target is nested inside, or contains, another target.

use std::fmt;
use std::path::Path;

use crate::state::MountEntry;

/// Differences between two mount sets, keyed by target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountDiff {
    /// Targets only in the new set.
    pub added: Vec<MountEntry>,
    /// Targets only in the old set.
    pub removed: Vec<MountEntry>,
    /// Targets in both sets whose source or permission changed, as `(old, new)`.
    pub rebound: Vec<(MountEntry, MountEntry)>,
    /// Targets in both sets appear in a different relative order.
    pub reordered: bool,
}

impl MountDiff {
    /// Compares the current mounts with the requested ones.
    #[must_use]
    pub fn between(old: &[MountEntry], new: &[MountEntry]) -> Self {
        let find = |set: &[MountEntry], target: &Path| set.iter().position(|m| m.target.as_path() == target);

        let added = new
            .iter()
            .filter(|m| find(old, &m.target).is_none())
            .cloned()
            .collect();
        let removed = old
            .iter()
            .filter(|m| find(new, &m.target).is_none())
            .cloned()
            .collect();

        let mut rebound = Vec::new();
        let mut kept_new_positions = Vec::new();
        for before in old {
            if let Some(pos) = find(new, &before.target) {
                let after = &new[pos];
                if after != before {
                    rebound.push((before.clone(), after.clone()));
                }
                kept_new_positions.push(pos);
            }
        }
        let reordered = kept_new_positions.windows(2).any(|w| w[0] > w[1]);

        Self {
            added,
            removed,
            rebound,
            reordered,
        }
    }

    /// True when both sets are the same list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.rebound.is_empty() && !self.reordered
    }

    fn changed_targets(&self) -> impl Iterator<Item = &Path> {
        self.added
            .iter()
            .chain(&self.removed)
            .map(|m| m.target.as_path())
    }
}

/// How a mount change is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Nothing to do.
    Unchanged,
    /// Reconfigure the existing container and restart it.
    Restart,
    /// Remove the container and create a new one; named volumes are kept.
    Recreate,
}

impl UpdateStrategy {
    /// Picks the strategy for going from `old` to `new`.
    #[must_use]
    pub fn decide(old: &[MountEntry], new: &[MountEntry], live_remount: bool) -> Self {
        Self::for_diff(&MountDiff::between(old, new), old, new, live_remount)
    }

    /// Like [`decide`](Self::decide) for an already computed diff.
    #[must_use]
    pub fn for_diff(
        diff: &MountDiff,
        old: &[MountEntry],
        new: &[MountEntry],
        live_remount: bool,
    ) -> Self {
        if diff.is_empty() {
            return Self::Unchanged;
        }
        if !live_remount || !diff.rebound.is_empty() || diff.reordered {
            return Self::Recreate;
        }

        let nests = diff.changed_targets().any(|changed| {
            old.iter().chain(new).any(|other| {
                let other = other.target.as_path();
                other != changed && (other.starts_with(changed) || changed.starts_with(other))
            })
        });
        if nests { Self::Recreate } else { Self::Restart }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::Restart => write!(f, "restart"),
            Self::Recreate => write!(f, "recreate"),
        }
    }
}
