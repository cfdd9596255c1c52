//! Durable, per-environment state.
//!
//! Each environment has exactly one [`EnvironmentRecord`], stored as JSON and
//! replaced wholesale on every change. Writers go through
//! [`EnvironmentStateStore::compare_and_swap`], so two processes acting on
//! the same environment cannot silently overwrite each other.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/
//! ├── environments/
//! │   ├── {id}.json                       # current record
//! │   └── .tempenv-{pid}-record-*.tmp     # staging file of an in-flight save
//! └── locks/
//!     └── {id}.lock                       # advisory lock, one per id
//! ```
//!
//! Lock files are never deleted; removing one while another process waits
//! on it would let two processes hold "the" lock at once.
//!
//! # Example
//!
//! ```no_run
//! use tempenv::state::{EnvironmentId, EnvironmentStateStore, StoreConfig};
//!
//! let store = EnvironmentStateStore::open(StoreConfig::default())?;
//! let id: EnvironmentId = "demo".parse()?;
//! if let Some(record) = store.load(&id)? {
//!     println!("{} is {}", record.id, record.status);
//! }
//! # Ok::<(), tempenv::Error>(())
//! ```

mod record;
mod storage;
mod store;

pub use record::{
    EnvironmentRecord, EnvironmentStatus, FailureInfo, MountEntry, Operation, PendingOperation,
    VolumeEntry,
};
pub use storage::{StatePaths, default_state_dir, ensure_state_dir};
pub use store::{EnvironmentStateStore, StoreConfig};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Longest accepted environment id.
pub const MAX_ID_LEN: usize = 63;

/// Name of an environment.
///
/// 1 to 63 characters from `[a-z0-9_.-]`, starting with a letter or digit.
/// Ids double as file names and container-name suffixes, hence the
/// restriction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Validates and wraps `id`.
    pub fn new(id: impl Into<String>) -> Result<Self, StateError> {
        let id = id.into();
        let invalid = |reason: &str| StateError::InvalidId {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if id.is_empty() {
            return Err(invalid("empty"));
        }
        if id.len() > MAX_ID_LEN {
            return Err(invalid("longer than 63 characters"));
        }
        if !id.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(invalid("must start with a lowercase letter or digit"));
        }
        if let Some(c) = id
            .chars()
            .find(|&c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')))
        {
            return Err(invalid(&format!("character {c:?} is not allowed")));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EnvironmentId {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EnvironmentId {
    type Error = StateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EnvironmentId> for String {
    fn from(id: EnvironmentId) -> Self {
        id.0
    }
}

impl AsRef<str> for EnvironmentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
