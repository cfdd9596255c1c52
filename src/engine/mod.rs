//! Container engine clients.
//!
//! The lifecycle code talks to a container engine only through the
//! [`ContainerEngine`] trait. [`DockerCli`] drives a Docker-compatible CLI
//! (`docker` or `podman`) with typed arguments; [`MockEngine`] keeps
//! everything in memory and can be told to fail.
//!
//! Implementations report a missing resource as `EngineError::NotFound`.
//! Callers cleaning up treat that as success.

mod docker;
mod mock;

pub use docker::{CommandOutput, DockerCli};
pub use mock::{EngineCall, MockContainer, MockEngine, MockOp};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::EngineError;

/// Label carrying the environment id on every resource tempenv creates.
pub const ID_LABEL: &str = "tempenv.id";

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// A named volume attached to the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeMount {
    pub name: String,
    pub target: PathBuf,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<BindMount>,
    pub volumes: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
    /// Command to keep the container alive; empty means the image default.
    pub command: Vec<String>,
}

/// Opaque engine identifier of a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

impl ContainerHandle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container status as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Other(String),
}

impl ContainerState {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Parses the engine's status word (`running`, `exited`, ...).
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" | "up" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" | "stopped" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Operations the lifecycle needs from a container engine.
///
/// Containers and volumes are addressed by name.
pub trait ContainerEngine: Send + Sync + fmt::Debug {
    /// Short engine name for messages (`docker`, `podman`, `mock`).
    fn name(&self) -> &str;

    /// Creates (but does not start) a container.
    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError>;

    fn start(&self, container: &str) -> Result<(), EngineError>;

    /// Stops a container. Stopping a stopped container succeeds.
    fn stop(&self, container: &str) -> Result<(), EngineError>;

    /// Removes a container, stopping it first if needed.
    fn remove_container(&self, container: &str) -> Result<(), EngineError>;

    /// Creates a named volume; an existing volume of that name is reused.
    fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), EngineError>;

    fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    fn inspect(&self, container: &str) -> Result<ContainerState, EngineError>;

    /// Runs `command` inside a running container attached to the caller's
    /// terminal and returns its exit status.
    fn exec_interactive(&self, container: &str, command: &[String]) -> Result<i32, EngineError>;

    /// Stops and starts a container.
    fn restart(&self, container: &str) -> Result<(), EngineError> {
        self.stop(container)?;
        self.start(container)
    }

    /// Whether [`reconfigure_mounts`](Self::reconfigure_mounts) works.
    fn supports_live_remount(&self) -> bool {
        false
    }

    /// Replaces the bind mounts of an existing container, taking effect at
    /// the next start.
    fn reconfigure_mounts(&self, _container: &str, _mounts: &[BindMount]) -> Result<(), EngineError> {
        Err(EngineError::Unsupported {
            engine: self.name().to_string(),
            operation: "reconfiguring mounts",
        })
    }
}
