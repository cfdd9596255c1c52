//! Mount specifications and mount-set resolution.
//!
//! A [`MountSpec`] is what the user typed. [`MountSetResolver`] turns an
//! ordered list of them into [`ValidatedMount`]s: every source goes through
//! the [`PathSecurityValidator`](crate::security::PathSecurityValidator),
//! every target is checked for shape and reserved paths, and duplicate
//! targets collapse to the last one given.
//!
//! # Example
//!
//! ```no_run
//! use tempenv::mounts::{MountSetResolver, MountSpec};
//!
//! let specs: Vec<MountSpec> = vec!["/tmp/proj:/workspace".parse()?];
//! let mounts = MountSetResolver::default().resolve(&specs)?;
//! assert_eq!(mounts.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod resolver;
mod spec;

pub use resolver::{
    CONTAINER_STATE_DIR, MountSetResolver, Resolution, ResolverConfig, TargetOverride,
    ValidatedMount,
};
pub use spec::{DEFAULT_TARGET_ROOT, MountPermission, MountSpec};
