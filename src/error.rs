//! Error types for tempenv.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Each component owns its error enum; [`Error`] wraps them for callers that
//! drive several components at once (the CLI, mostly).

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A host path or mount target was rejected.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Security(#[from] SecurityError),

    /// A mount string could not be parsed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    MountSpec(#[from] MountSpecError),

    /// A requested mount set was rejected.
    #[error(transparent)]
    #[diagnostic(transparent)]
    MountSet(#[from] MountSetError),

    /// Environment state could not be read or written.
    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    /// A lifecycle operation failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Temporary file bookkeeping failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    /// The container engine reported an error.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(tempenv::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(tempenv::io))]
    Io(#[from] std::io::Error),
}

/// Reasons a host path is refused.
///
/// Messages name the input and the rule that fired. They never echo the
/// resolved path, so a rejection does not reveal where a symlink points.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Null bytes, control characters or shell metacharacters in the input.
    #[error("path {path:?} contains a forbidden character ({found:?})")]
    #[diagnostic(
        code(tempenv::security::dangerous_characters),
        help("remove shell metacharacters (; | & $ ` \" ' ( ) < >) and control characters from the path")
    )]
    DangerousCharacters { path: String, found: char },

    /// The path resolves to the filesystem root or under a protected system root.
    #[error("path {path:?} resolves into a protected system directory")]
    #[diagnostic(
        code(tempenv::security::system_path),
        help("mount a project directory, a directory under your home, or a /tmp subdirectory instead")
    )]
    SystemPathForbidden { path: String },

    /// The path does not exist (or could not be resolved) at validation time.
    #[error("path {path:?} does not exist or cannot be resolved")]
    #[diagnostic(code(tempenv::security::not_found))]
    PathNotFound { path: String },

    /// `..` segments escape the root the path was anchored to.
    #[error("path {path:?} escapes its root through '..' segments")]
    #[diagnostic(
        code(tempenv::security::traversal),
        help("use a path that stays inside the directory it names")
    )]
    TraversalDetected { path: String },

    /// The validator was confined to a set of roots and the path lies outside all of them.
    #[error("path {path:?} is outside the allowed directories")]
    #[diagnostic(code(tempenv::security::not_allowed))]
    OutsideAllowedRoots { path: String },

    /// A container-side mount target is malformed.
    #[error("mount target {target:?} is invalid: {reason}")]
    #[diagnostic(code(tempenv::security::invalid_target))]
    InvalidTarget { target: String, reason: String },

    /// A container-side mount target collides with a path tempenv manages itself.
    #[error("mount target {target:?} is reserved")]
    #[diagnostic(
        code(tempenv::security::reserved_target),
        help("choose a target outside {reserved}")
    )]
    ReservedTarget { target: String, reserved: String },

    /// The source resolved somewhere else than when it was first validated.
    #[error("mount source {path:?} changed since it was validated")]
    #[diagnostic(
        code(tempenv::security::source_changed),
        help("the path or a symlink along it was modified; retry the operation")
    )]
    SourceChanged { path: String },
}

/// A `source[:target][:perm]` string could not be parsed.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
#[error("invalid mount {input:?}: {reason}")]
#[diagnostic(
    code(tempenv::mounts::parse),
    help("use 'source', 'source:ro|rw', 'source:/target' or 'source:/target:ro|rw'")
)]
pub struct MountSpecError {
    pub input: String,
    pub reason: String,
}

/// A mount set was rejected; identifies the offending spec.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
#[error("mount #{index} ({spec}) rejected")]
#[diagnostic(code(tempenv::mounts::rejected))]
pub struct MountSetError {
    /// Position of the spec in the requested set.
    pub index: usize,
    /// Display form of the spec.
    pub spec: String,
    #[source]
    #[diagnostic_source]
    pub source: SecurityError,
}

/// Errors related to persisted environment state.
#[derive(Error, Debug, Diagnostic)]
pub enum StateError {
    /// Someone else changed the record first.
    #[error("environment {id} was modified concurrently: {detail}")]
    #[diagnostic(
        code(tempenv::state::conflict),
        help("reload the environment and retry against its latest version")
    )]
    Conflict { id: String, detail: String },

    /// The record on disk cannot be parsed or does not belong to this id.
    #[error("environment record {path} is corrupt: {reason}")]
    #[diagnostic(
        code(tempenv::state::corrupt),
        help("inspect or remove the file by hand; tempenv will not overwrite it")
    )]
    Corrupt { path: PathBuf, reason: String },

    /// No record for this id.
    #[error("environment {id} not found")]
    #[diagnostic(code(tempenv::state::not_found))]
    NotFound { id: String },

    /// The id cannot be used as a record name.
    #[error("invalid environment id {id:?}: {reason}")]
    #[diagnostic(
        code(tempenv::state::invalid_id),
        help("ids are 1-63 characters of lowercase letters, digits, '.', '_' or '-', starting with a letter or digit")
    )]
    InvalidId { id: String, reason: String },

    /// I/O error while touching the state directory.
    #[error("state I/O error: {context}")]
    #[diagnostic(code(tempenv::state::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The staging file for a save could not be created.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Staging(#[from] RegistryError),
}

/// Errors raised while driving an environment through its lifecycle.
#[derive(Error, Debug, Diagnostic)]
pub enum LifecycleError {
    /// The container engine cannot be reached at all.
    #[error("container engine unavailable while handling {id}: {reason}")]
    #[diagnostic(
        code(tempenv::lifecycle::engine_unavailable),
        help("check that the container daemon is running and that you may talk to it")
    )]
    EngineUnavailable { id: String, reason: String },

    /// Creation failed; whatever could not be rolled back is listed.
    #[error("creating {id} failed: {reason}")]
    #[diagnostic(
        code(tempenv::lifecycle::partial_create),
        help("leftover resources (if any): {leftover:?}; `tempenv destroy` retries the cleanup")
    )]
    PartialCreateFailed {
        id: String,
        reason: String,
        leftover: Vec<String>,
    },

    /// Destruction stopped part-way; the record is kept for a retry.
    #[error("destroying {id} failed: {reason}")]
    #[diagnostic(
        code(tempenv::lifecycle::partial_destroy),
        help("leftover resources: {leftover:?}; rerun `tempenv destroy` to finish")
    )]
    PartialDestroyFailed {
        id: String,
        reason: String,
        leftover: Vec<String>,
    },

    /// The environment does not exist.
    #[error("environment {id} not found")]
    #[diagnostic(code(tempenv::lifecycle::not_found))]
    NotFound { id: String },

    /// The requested operation is not valid from the current status.
    #[error("cannot {operation} environment {id} while it is {status}")]
    #[diagnostic(code(tempenv::lifecycle::invalid_transition))]
    InvalidTransition {
        id: String,
        operation: String,
        status: String,
    },

    /// The image reference is unusable.
    #[error("invalid image reference {image:?}: {reason}")]
    #[diagnostic(code(tempenv::lifecycle::invalid_image))]
    InvalidImage { image: String, reason: String },

    /// An interrupt arrived; the record was left in a recoverable status.
    #[error("operation on {id} interrupted")]
    #[diagnostic(code(tempenv::lifecycle::interrupted))]
    Interrupted { id: String },

    /// A mount was rejected on re-validation.
    #[error(transparent)]
    #[diagnostic(transparent)]
    MountSet(#[from] MountSetError),

    /// State store failure.
    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    /// Engine failure outside create/destroy rollback.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

/// Errors from the temporary file registry.
#[derive(Error, Debug, Diagnostic)]
pub enum RegistryError {
    /// A temp file or directory could not be created.
    #[error("failed to create temporary {kind} in {dir}")]
    #[diagnostic(code(tempenv::tempfiles::create))]
    CreateFailed {
        kind: &'static str,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Some tracked paths could not be removed.
    #[error("failed to remove {} temporary path(s)", .failed.len())]
    #[diagnostic(
        code(tempenv::tempfiles::sweep_partial),
        help("remove them by hand: {failed:?}")
    )]
    SweepPartial { failed: Vec<PathBuf> },

    /// Signal handlers could not be installed.
    #[error("failed to install cleanup handlers: {reason}")]
    #[diagnostic(code(tempenv::tempfiles::handler))]
    HandlerInstall { reason: String },
}

/// Errors reported by a container engine client.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The named resource does not exist.
    #[error("{kind} {name} not found")]
    #[diagnostic(code(tempenv::engine::not_found))]
    NotFound { kind: &'static str, name: String },

    /// The engine binary or daemon cannot be reached.
    #[error("container engine unavailable: {reason}")]
    #[diagnostic(
        code(tempenv::engine::unavailable),
        help("start the container daemon, or pick another engine with --engine")
    )]
    Unavailable { reason: String },

    /// The current user may not talk to the daemon.
    #[error("permission denied talking to the container engine")]
    #[diagnostic(
        code(tempenv::engine::permission),
        help("add your user to the engine's group (e.g. `sudo usermod -aG docker $USER`) and log in again")
    )]
    PermissionDenied,

    /// The engine does not implement this operation.
    #[error("{engine} does not support {operation}")]
    #[diagnostic(code(tempenv::engine::unsupported))]
    Unsupported {
        engine: String,
        operation: &'static str,
    },

    /// Any other non-success response.
    #[error("{operation} failed: {message}")]
    #[diagnostic(code(tempenv::engine::command_failed))]
    CommandFailed {
        operation: String,
        message: String,
    },
}

impl EngineError {
    /// True when the engine reported the resource already gone.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the engine itself cannot be reached.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::PermissionDenied)
    }
}

/// Errors related to system requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Not a Unix host.
    #[error("Platform {found} is not supported")]
    #[diagnostic(
        code(tempenv::system::platform),
        help("tempenv relies on Unix file locking and signals; run it on Linux or macOS")
    )]
    UnsupportedPlatform { found: String },

    /// The engine binary is not on PATH.
    #[error("Container engine '{engine}' is not installed")]
    #[diagnostic(
        code(tempenv::system::engine_missing),
        help("install {engine} or pick another engine with --engine")
    )]
    EngineNotInstalled { engine: String },

    /// The engine binary exists but its daemon does not answer.
    #[error("Container engine '{engine}' is not running")]
    #[diagnostic(
        code(tempenv::system::engine_down),
        help("start the daemon (e.g. `sudo systemctl start {engine}`)")
    )]
    EngineNotRunning { engine: String },

    /// The daemon refuses the current user.
    #[error("Permission denied talking to '{engine}'")]
    #[diagnostic(
        code(tempenv::system::engine_permission),
        help("add your user to the '{engine}' group and start a new login session")
    )]
    EnginePermission { engine: String },

    /// The state directory cannot be written.
    #[error("State directory {path} is not writable")]
    #[diagnostic(
        code(tempenv::system::state_dir),
        help("pass --state-dir or set TEMPENV_STATE_DIR to a writable directory")
    )]
    StateDirNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(tempenv::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
