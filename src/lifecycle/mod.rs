//! Environment lifecycle.
//!
//! [`LifecycleOrchestrator`] owns the state machine:
//!
//! ```text
//! absent -> provisioning -> running <-> stopped -> destroying -> absent
//!                |   ^           |           |            |
//!                |   +-----------+-----------+            |
//!                |           (recreate)                   |
//!                +-------------> failed <-----------------+
//! ```
//!
//! Mount changes are planned by [`UpdateStrategy::decide`]. A recreate goes
//! back through `provisioning` and ends in the status it started from.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tempenv::engine::DockerCli;
//! use tempenv::lifecycle::{ImageRef, LifecycleConfig, LifecycleOrchestrator};
//! use tempenv::mounts::{MountSetResolver, MountSpec};
//! use tempenv::state::{EnvironmentId, EnvironmentStateStore, StoreConfig, default_state_dir};
//!
//! let store = EnvironmentStateStore::open(StoreConfig::new(default_state_dir())).unwrap();
//! let orchestrator = LifecycleOrchestrator::new(
//!     Arc::new(DockerCli::default()),
//!     store,
//!     MountSetResolver::default(),
//!     LifecycleConfig::default(),
//! );
//!
//! let id = EnvironmentId::new("demo").unwrap();
//! let mounts = orchestrator
//!     .resolver()
//!     .resolve(&["/tmp/a:/work".parse::<MountSpec>().unwrap()])
//!     .unwrap();
//! orchestrator
//!     .create(&id, &mounts, &ImageRef::new("ubuntu:24.04").unwrap())
//!     .unwrap();
//! orchestrator.destroy(&id).unwrap();
//! ```

mod orchestrator;
mod plan;

pub use orchestrator::{
    EnvironmentReport, ImageRef, LifecycleConfig, LifecycleOrchestrator, MountSelector,
    MountUpdate, VolumeTemplate,
};
pub use plan::{MountDiff, UpdateStrategy};
