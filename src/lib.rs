//! tempenv - disposable container development environments.
//!
//! This crate manages temporary, container-backed development environments
//! with host directories mounted into them. Host paths are validated against
//! symlink swaps, traversal and shell-metacharacter injection before they are
//! exposed, and environment state is kept consistent across crashes,
//! interrupts and concurrent invocations.
//!
//! # Components
//!
//! - [`security`]: canonicalises and classifies candidate host paths
//! - [`tempfiles`]: process-wide temp file registry with cleanup on exit and signals
//! - [`mounts`]: turns mount requests into a validated, ordered mount set
//! - [`state`]: crash-safe, per-environment locked state store
//! - [`lifecycle`]: create / update / destroy state machine with rollback
//! - [`engine`]: container engine clients
//!
//! # Example
//!
//! ```no_run
//! use tempenv::mounts::{MountSetResolver, MountSpec};
//!
//! let specs: Vec<MountSpec> = vec!["/tmp/proj:/workspace".parse().unwrap()];
//! let mounts = MountSetResolver::default().resolve(&specs)?;
//! assert_eq!(mounts.len(), 1);
//! # Ok::<(), tempenv::Error>(())
//! ```

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod mounts;
pub mod security;
pub mod state;
pub mod system;
pub mod tempfiles;

// Re-export commonly used types
pub use error::{Error, Result};
pub use lifecycle::{ImageRef, LifecycleConfig, LifecycleOrchestrator};
pub use mounts::{MountSetResolver, MountSpec, ValidatedMount};
pub use security::PathSecurityValidator;
pub use state::{EnvironmentId, EnvironmentRecord, EnvironmentStateStore};
pub use tempfiles::TempFileRegistry;
