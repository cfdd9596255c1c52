//! Environment lifecycle: create, update mounts, start/stop, destroy.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::engine::{BindMount, ContainerEngine, ContainerSpec, ContainerState, ID_LABEL, VolumeMount};
use crate::error::{EngineError, LifecycleError, StateError};
use crate::lifecycle::plan::{MountDiff, UpdateStrategy};
use crate::mounts::{MountSetResolver, MountSpec, ValidatedMount};
use crate::state::{
    EnvironmentId, EnvironmentRecord, EnvironmentStateStore, EnvironmentStatus, MountEntry,
    Operation, PendingOperation, VolumeEntry,
};
use crate::tempfiles::InterruptState;

/// A named volume every environment gets, independent of its mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeTemplate {
    /// Appended to the container name to form the volume name.
    pub suffix: String,
    pub target: PathBuf,
}

impl VolumeTemplate {
    #[must_use]
    pub fn new(suffix: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            suffix: suffix.into(),
            target: target.into(),
        }
    }
}

/// Configuration for the lifecycle orchestrator.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Prefix of container and volume names.
    pub container_prefix: String,
    pub volumes: Vec<VolumeTemplate>,
    /// How many times `inspect` is polled after a start.
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    /// Command keeping the container alive.
    pub command: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// What [`LifecycleOrchestrator::shell`] runs when no command is given.
    pub shell: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            container_prefix: "tempenv-".to_string(),
            volumes: vec![VolumeTemplate::new("cache", "/home/developer/.cache")],
            readiness_attempts: 10,
            readiness_interval: Duration::from_millis(500),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            workdir: Some(PathBuf::from("/workspace")),
            shell: vec!["/bin/bash".to_string()],
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_container_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.container_prefix = prefix.into();
        self
    }

    /// Replaces the per-environment volumes.
    #[must_use]
    pub fn with_volumes(mut self, volumes: Vec<VolumeTemplate>) -> Self {
        self.volumes = volumes;
        self
    }

    #[must_use]
    pub fn with_readiness(mut self, attempts: u32, interval: Duration) -> Self {
        self.readiness_attempts = attempts;
        self.readiness_interval = interval;
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    #[must_use]
    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }

    /// Engine-side container name for `id`.
    #[must_use]
    pub fn container_name(&self, id: &EnvironmentId) -> String {
        format!("{}{id}", self.container_prefix)
    }

    fn volume_entries(&self, id: &EnvironmentId) -> Vec<VolumeEntry> {
        let container = self.container_name(id);
        self.volumes
            .iter()
            .map(|v| VolumeEntry {
                name: format!("{container}-{}", v.suffix),
                target: v.target.clone(),
            })
            .collect()
    }
}

/// A container image reference, checked before it reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(String);

impl ImageRef {
    /// Accepts `name[:tag][@digest]` made of ASCII letters, digits and `._-/:@`.
    pub fn new(image: impl Into<String>) -> Result<Self, LifecycleError> {
        let image = image.into();
        let invalid = |reason: &str| LifecycleError::InvalidImage {
            image: image.clone(),
            reason: reason.to_string(),
        };

        if image.is_empty() {
            return Err(invalid("empty"));
        }
        if image.len() > 255 {
            return Err(invalid("longer than 255 characters"));
        }
        if image.starts_with('-') {
            return Err(invalid("starts with '-'"));
        }
        if let Some(c) = image
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || "._-/:@".contains(*c)))
        {
            return Err(invalid(&format!("contains {c:?}")));
        }
        Ok(Self(image))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ImageRef {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a mount update.
#[derive(Debug, Clone)]
pub struct MountUpdate {
    /// The stored record afterwards.
    pub record: EnvironmentRecord,
    /// The strategy that was chosen (before any fallback).
    pub strategy: UpdateStrategy,
    /// Set when a restart was tried, failed, and the container was recreated instead.
    pub restart_error: Option<String>,
}

impl MountUpdate {
    /// True if the container was recreated.
    #[must_use]
    pub fn recreated(&self) -> bool {
        self.strategy == UpdateStrategy::Recreate || self.restart_error.is_some()
    }
}

/// Which mounts [`LifecycleOrchestrator::remove_mounts`] drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSelector {
    All,
    /// Mounts whose host source or container target is one of these paths.
    Paths(Vec<PathBuf>),
}

impl MountSelector {
    fn matches(&self, entry: &MountEntry) -> bool {
        match self {
            Self::All => true,
            Self::Paths(paths) => paths.iter().any(|p| {
                entry.target == *p
                    || entry.source == *p
                    || fs::canonicalize(p).is_ok_and(|c| entry.source == c)
            }),
        }
    }
}

/// A record together with what the engine says about its container.
#[derive(Debug, Clone)]
pub struct EnvironmentReport {
    pub record: EnvironmentRecord,
    /// `None` when the engine has no such container.
    pub container: Option<ContainerState>,
}

/// Drives environments through their lifecycle.
///
/// Every state change goes through the store's compare-and-swap. Operations
/// that touch the engine first leave a pending claim on the record, so a
/// second caller gets a conflict instead of racing.
#[derive(Debug)]
pub struct LifecycleOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    store: EnvironmentStateStore,
    resolver: MountSetResolver,
    interrupt: Arc<InterruptState>,
    config: LifecycleConfig,
}

/// Engine resources created so far by a create or recreate.
#[derive(Debug, Default)]
struct Created {
    volumes: Vec<String>,
    container_attempted: bool,
}

impl LifecycleOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: EnvironmentStateStore,
        resolver: MountSetResolver,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            engine,
            store,
            resolver,
            interrupt: InterruptState::global(),
            config,
        }
    }

    /// Uses `interrupt` instead of the process-wide state.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Arc<InterruptState>) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[must_use]
    pub fn store(&self) -> &EnvironmentStateStore {
        &self.store
    }

    #[must_use]
    pub fn resolver(&self) -> &MountSetResolver {
        &self.resolver
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Creates and starts the environment `id`.
    ///
    /// Creating an environment that is already running with the same mounts
    /// and image returns the stored record. On an engine failure everything
    /// created so far is removed and the record is left `Failed`.
    ///
    /// # Errors
    ///
    /// - `LifecycleError::State(StateError::Conflict)` if another operation
    ///   owns the id or the record was left half-way by a dead process
    /// - `LifecycleError::InvalidTransition` if the id exists in another state
    /// - `LifecycleError::MountSet` if a mount fails re-validation
    /// - `LifecycleError::PartialCreateFailed` / `EngineUnavailable` on engine failure
    #[instrument(skip(self, mounts), fields(%id, %image, mounts = mounts.len()))]
    pub fn create(
        &self,
        id: &EnvironmentId,
        mounts: &[ValidatedMount],
        image: &ImageRef,
    ) -> Result<EnvironmentRecord, LifecycleError> {
        let _section = self.interrupt.critical();
        let entries: Vec<MountEntry> = mounts.iter().map(MountEntry::from).collect();

        if let Some(existing) = self.store.load(id)? {
            ensure_unclaimed(&existing)?;
            if existing.status == EnvironmentStatus::Running
                && existing.has_mounts(&entries)
                && existing.image == image.as_str()
            {
                debug!("Already running with the requested mounts");
                return Ok(existing);
            }
            if existing.status.is_in_progress() {
                return Err(StateError::Conflict {
                    id: id.to_string(),
                    detail: format!(
                        "left {} by an interrupted operation; destroy it first",
                        existing.status
                    ),
                }
                .into());
            }
            return Err(invalid_transition(&existing, "create"));
        }
        self.checkpoint(id)?;

        let container_name = self.config.container_name(id);
        let mut record = EnvironmentRecord::new(
            id.clone(),
            container_name,
            image.as_str(),
            entries,
            self.config.volume_entries(id),
        );
        record.pending = Some(PendingOperation::new(Operation::Create));
        let record = self.store.compare_and_swap(id, None, record)?;
        debug!(version = record.version, "Claimed environment");

        let mounts = match self.resolver.revalidate(mounts) {
            Ok(mounts) => mounts,
            Err(e) => {
                // Nothing exists on the engine yet.
                if let Err(remove_err) = self.store.remove(id, Some(record.version)) {
                    warn!(error = %remove_err, "Failed to discard claim after rejected mount");
                }
                return Err(e.into());
            }
        };

        let mut created = Created::default();
        match self.provision(record.clone(), &mounts, &mut created) {
            Ok(running) => {
                info!(container = %running.container_name, "Environment created");
                Ok(running)
            }
            Err(LifecycleError::Interrupted { id }) => Err(LifecycleError::Interrupted { id }),
            Err(e) => Err(self.fail_create(id, &e, &created)),
        }
    }

    /// Applies a new mount set to a running or stopped environment.
    ///
    /// The new set replaces the current one; the result keeps its order.
    /// See [`UpdateStrategy`] for when the container is restarted or
    /// recreated. A stopped environment stays stopped: its container is
    /// reconfigured or recreated but not started. A failed restart is logged and returned in
    /// [`MountUpdate::restart_error`] before the container is recreated.
    ///
    /// # Errors
    ///
    /// - `LifecycleError::State(StateError::Conflict)` if the record changed
    ///   or another operation is in progress
    /// - `LifecycleError::NotFound`, `InvalidTransition`, `MountSet`
    /// - `LifecycleError::PartialCreateFailed` if the recreate fails
    #[instrument(skip(self, new_mounts), fields(%id, mounts = new_mounts.len()))]
    pub fn update_mounts(
        &self,
        id: &EnvironmentId,
        new_mounts: &[ValidatedMount],
    ) -> Result<MountUpdate, LifecycleError> {
        let _section = self.interrupt.critical();
        let current = self.get(id)?;
        ensure_unclaimed(&current)?;
        if !matches!(
            current.status,
            EnvironmentStatus::Running | EnvironmentStatus::Stopped
        ) {
            return Err(invalid_transition(&current, "update mounts of"));
        }

        let entries: Vec<MountEntry> = new_mounts.iter().map(MountEntry::from).collect();
        let diff = MountDiff::between(&current.mounts, &entries);
        let strategy = UpdateStrategy::for_diff(
            &diff,
            &current.mounts,
            &entries,
            self.engine.supports_live_remount(),
        );
        debug!(
            %strategy,
            added = diff.added.len(),
            removed = diff.removed.len(),
            rebound = diff.rebound.len(),
            reordered = diff.reordered,
            "Planned mount update"
        );
        if strategy == UpdateStrategy::Unchanged {
            return Ok(MountUpdate {
                record: current,
                strategy,
                restart_error: None,
            });
        }

        let claimed = self.swap(&current, |r| {
            r.pending = Some(PendingOperation::new(Operation::UpdateMounts));
        })?;

        let mounts = match self.resolver.revalidate(new_mounts) {
            Ok(mounts) => mounts,
            Err(e) => {
                self.release_claim(&claimed);
                return Err(e.into());
            }
        };

        let mut restart_error = None;
        if strategy == UpdateStrategy::Restart {
            match self.restart_with(&claimed, &mounts, &entries) {
                Ok(record) => {
                    info!("Mounts updated by restart");
                    return Ok(MountUpdate {
                        record,
                        strategy,
                        restart_error: None,
                    });
                }
                Err(LifecycleError::Interrupted { id }) => {
                    return Err(LifecycleError::Interrupted { id });
                }
                Err(e) => {
                    error!(error = %e, "Restart with new mounts failed, recreating the container");
                    restart_error = Some(e.to_string());
                }
            }
        }

        // The restart path does not write the record, so `claimed` is current.
        let record = self.recreate(&claimed, &mounts, &entries, restart_error.as_deref())?;
        info!("Mounts updated by recreating the container");
        Ok(MountUpdate {
            record,
            strategy,
            restart_error,
        })
    }

    /// Adds mounts to an environment. A spec whose target is already mounted
    /// replaces that mount.
    pub fn add_mounts(
        &self,
        id: &EnvironmentId,
        specs: &[MountSpec],
    ) -> Result<MountUpdate, LifecycleError> {
        let current = self.get(id)?;
        let mut combined: Vec<MountSpec> = current.mounts.iter().map(MountEntry::to_spec).collect();
        combined.extend_from_slice(specs);
        let resolved = self.resolver.resolve(&combined)?;
        self.update_mounts(id, &resolved)
    }

    /// Removes the mounts `selector` picks.
    pub fn remove_mounts(
        &self,
        id: &EnvironmentId,
        selector: &MountSelector,
    ) -> Result<MountUpdate, LifecycleError> {
        let current = self.get(id)?;
        let remaining: Vec<MountSpec> = current
            .mounts
            .iter()
            .filter(|m| !selector.matches(m))
            .map(MountEntry::to_spec)
            .collect();
        if remaining.len() == current.mounts.len() {
            warn!(%id, "No mount matched; nothing removed");
        }
        let resolved = self.resolver.resolve(&remaining)?;
        self.update_mounts(id, &resolved)
    }

    /// Starts a stopped environment. Starting a running one does nothing.
    #[instrument(skip(self), fields(%id))]
    pub fn start(&self, id: &EnvironmentId) -> Result<EnvironmentRecord, LifecycleError> {
        let _section = self.interrupt.critical();
        let current = self.get(id)?;
        ensure_unclaimed(&current)?;
        match current.status {
            EnvironmentStatus::Running => Ok(current),
            EnvironmentStatus::Stopped => {
                self.checkpoint(id)?;
                let claimed = self.swap(&current, |r| {
                    r.pending = Some(PendingOperation::new(Operation::Start));
                })?;
                if let Err(e) = self.engine.start(&claimed.container_name) {
                    self.release_claim(&claimed);
                    return Err(e.into());
                }
                if let Err(e) = self.wait_ready(&claimed.container_name) {
                    self.stop_quietly(&claimed.container_name);
                    self.release_claim(&claimed);
                    return Err(e);
                }
                let record = self.swap(&claimed, |r| {
                    r.status = EnvironmentStatus::Running;
                    r.pending = None;
                })?;
                info!("Environment started");
                Ok(record)
            }
            _ => Err(invalid_transition(&current, "start")),
        }
    }

    /// Stops a running environment. Stopping a stopped one does nothing.
    #[instrument(skip(self), fields(%id))]
    pub fn stop(&self, id: &EnvironmentId) -> Result<EnvironmentRecord, LifecycleError> {
        let _section = self.interrupt.critical();
        let current = self.get(id)?;
        ensure_unclaimed(&current)?;
        match current.status {
            EnvironmentStatus::Stopped => Ok(current),
            EnvironmentStatus::Running => {
                let claimed = self.swap(&current, |r| {
                    r.pending = Some(PendingOperation::new(Operation::Stop));
                })?;
                if let Err(e) = self.engine.stop(&claimed.container_name) {
                    self.release_claim(&claimed);
                    return Err(e.into());
                }
                let record = self.swap(&claimed, |r| {
                    r.status = EnvironmentStatus::Stopped;
                    r.pending = None;
                })?;
                info!("Environment stopped");
                Ok(record)
            }
            _ => Err(invalid_transition(&current, "stop")),
        }
    }

    /// Restarts a running or stopped environment; it is running afterwards.
    ///
    /// If the engine rejects the restart, the claim is released and the
    /// record keeps its previous status. A container that does not come up
    /// is stopped and recorded as `Stopped`.
    #[instrument(skip(self), fields(%id))]
    pub fn restart(&self, id: &EnvironmentId) -> Result<EnvironmentRecord, LifecycleError> {
        let _section = self.interrupt.critical();
        let current = self.get(id)?;
        ensure_unclaimed(&current)?;
        if !matches!(
            current.status,
            EnvironmentStatus::Running | EnvironmentStatus::Stopped
        ) {
            return Err(invalid_transition(&current, "restart"));
        }
        self.checkpoint(id)?;

        let claimed = self.swap(&current, |r| {
            r.pending = Some(PendingOperation::new(Operation::Restart));
        })?;
        if let Err(e) = self.engine.restart(&claimed.container_name) {
            self.release_claim(&claimed);
            return Err(e.into());
        }
        if let Err(e) = self.wait_ready(&claimed.container_name) {
            self.stop_quietly(&claimed.container_name);
            let stopped = self.swap(&claimed, |r| {
                r.status = EnvironmentStatus::Stopped;
                r.pending = None;
            });
            if let Err(save_err) = stopped {
                error!(error = %save_err, "Failed to record stopped container");
            }
            return Err(e);
        }
        let record = self.swap(&claimed, |r| {
            r.status = EnvironmentStatus::Running;
            r.pending = None;
        })?;
        info!("Environment restarted");
        Ok(record)
    }

    /// Runs `command` (the configured shell if empty) in a running
    /// environment, attached to the terminal. Returns its exit status.
    #[instrument(skip(self, command), fields(%id))]
    pub fn shell(&self, id: &EnvironmentId, command: &[String]) -> Result<i32, LifecycleError> {
        let record = self.get(id)?;
        if record.status != EnvironmentStatus::Running {
            return Err(invalid_transition(&record, "open a shell in"));
        }
        let command = if command.is_empty() {
            self.config.shell.as_slice()
        } else {
            command
        };
        let code = self.engine.exec_interactive(&record.container_name, command)?;
        debug!(code, "Shell exited");
        Ok(code)
    }

    /// The stored record plus the engine's view of the container.
    #[instrument(skip(self), fields(%id))]
    pub fn status(&self, id: &EnvironmentId) -> Result<EnvironmentReport, LifecycleError> {
        let record = self.get(id)?;
        let container = match self.engine.inspect(&record.container_name) {
            Ok(state) => Some(state),
            Err(e) if e.is_absent() => None,
            Err(e) => return Err(e.into()),
        };
        Ok(EnvironmentReport { record, container })
    }

    /// All stored environments, sorted by id.
    pub fn list(&self) -> Result<Vec<EnvironmentRecord>, LifecycleError> {
        Ok(self.store.list()?)
    }

    /// Stops and removes the container and volumes, then deletes the record.
    ///
    /// Destroying an absent id succeeds. Resources the engine reports as
    /// already gone count as removed. If anything else fails the record is
    /// kept as `Failed`, listing what is left, and a later destroy retries.
    ///
    /// # Errors
    ///
    /// - `LifecycleError::State(StateError::Conflict)` if another live operation owns the record
    /// - `LifecycleError::PartialDestroyFailed` / `EngineUnavailable` if cleanup fails
    #[instrument(skip(self), fields(%id))]
    pub fn destroy(&self, id: &EnvironmentId) -> Result<(), LifecycleError> {
        let _section = self.interrupt.critical();
        let Some(current) = self.store.load(id)? else {
            debug!("Already absent");
            return Ok(());
        };
        ensure_unclaimed(&current)?;
        if current.status == EnvironmentStatus::Destroyed {
            self.store.remove(id, Some(current.version))?;
            return Ok(());
        }
        if let Some(pending) = &current.pending {
            warn!(
                owner_pid = pending.owner_pid,
                operation = ?pending.operation,
                "Taking over an abandoned operation"
            );
        }

        let record = self.swap(&current, |r| {
            r.status = EnvironmentStatus::Destroying;
            r.pending = Some(PendingOperation::new(Operation::Destroy));
        })?;
        self.checkpoint(id)?;

        let name = record.container_name.clone();
        let mut leftover = Vec::new();
        let mut failure: Option<EngineError> = None;

        match self.engine.stop(&name) {
            Ok(()) => trace!("Container stopped"),
            Err(e) if e.is_absent() => debug!("Container already gone"),
            Err(e) => debug!(error = %e, "Stop failed, removing anyway"),
        }
        self.checkpoint(id)?;

        if let Err(e) = tolerate_absent(self.engine.remove_container(&name)) {
            error!(container = %name, error = %e, "Failed to remove container");
            leftover.push(format!("container:{name}"));
            failure.get_or_insert(e);
        }
        for volume in &record.volumes {
            self.checkpoint(id)?;
            if let Err(e) = tolerate_absent(self.engine.remove_volume(&volume.name)) {
                error!(volume = %volume.name, error = %e, "Failed to remove volume");
                leftover.push(format!("volume:{}", volume.name));
                failure.get_or_insert(e);
            }
        }

        if let Some(e) = failure {
            let reason = format!("destroy failed: {e}");
            if let Err(save_err) = self.swap(&record, |r| r.mark_failed(reason.clone(), leftover.clone())) {
                error!(error = %save_err, "Failed to record destroy failure");
            }
            if e.is_unavailable() {
                return Err(LifecycleError::EngineUnavailable {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
            return Err(LifecycleError::PartialDestroyFailed {
                id: id.to_string(),
                reason: e.to_string(),
                leftover,
            });
        }

        let destroyed = self.swap(&record, |r| {
            r.status = EnvironmentStatus::Destroyed;
            r.pending = None;
            r.container_handle = None;
        })?;
        self.store.remove(id, Some(destroyed.version))?;
        info!("Environment destroyed");
        Ok(())
    }

    fn get(&self, id: &EnvironmentId) -> Result<EnvironmentRecord, LifecycleError> {
        self.store
            .load(id)?
            .ok_or_else(|| LifecycleError::NotFound { id: id.to_string() })
    }

    /// Stores a modified copy of `current`, checking the status change.
    fn swap(
        &self,
        current: &EnvironmentRecord,
        update: impl FnOnce(&mut EnvironmentRecord),
    ) -> Result<EnvironmentRecord, LifecycleError> {
        let mut next = current.clone();
        update(&mut next);
        if !current.status.can_transition_to(next.status) {
            return Err(invalid_transition(current, &format!("move to {}", next.status)));
        }
        Ok(self
            .store
            .compare_and_swap(&current.id, Some(current.version), next)?)
    }

    fn release_claim(&self, claimed: &EnvironmentRecord) {
        if let Err(e) = self.swap(claimed, |r| r.pending = None) {
            warn!(error = %e, "Failed to release claim");
        }
    }

    fn checkpoint(&self, id: &EnvironmentId) -> Result<(), LifecycleError> {
        if self.interrupt.checkpoint() {
            Ok(())
        } else {
            warn!(%id, "Interrupted; leaving the environment for a later destroy");
            Err(LifecycleError::Interrupted { id: id.to_string() })
        }
    }

    fn container_spec(&self, record: &EnvironmentRecord, mounts: &[ValidatedMount]) -> ContainerSpec {
        ContainerSpec {
            name: record.container_name.clone(),
            image: record.image.clone(),
            mounts: bind_mounts(mounts),
            volumes: record
                .volumes
                .iter()
                .map(|v| VolumeMount {
                    name: v.name.clone(),
                    target: v.target.clone(),
                })
                .collect(),
            labels: BTreeMap::from([(ID_LABEL.to_string(), record.id.to_string())]),
            workdir: self.config.workdir.clone(),
            command: self.config.command.clone(),
        }
    }

    /// Creates volumes and container, starts it and marks the record running.
    fn provision(
        &self,
        record: EnvironmentRecord,
        mounts: &[ValidatedMount],
        created: &mut Created,
    ) -> Result<EnvironmentRecord, LifecycleError> {
        let id = record.id.clone();
        let labels = BTreeMap::from([(ID_LABEL.to_string(), id.to_string())]);

        for volume in &record.volumes {
            self.checkpoint(&id)?;
            self.engine.create_volume(&volume.name, &labels)?;
            created.volumes.push(volume.name.clone());
            trace!(volume = %volume.name, "Volume ready");
        }

        self.checkpoint(&id)?;
        let spec = self.container_spec(&record, mounts);
        created.container_attempted = true;
        let handle = self.engine.create_container(&spec)?;
        let record = self.swap(&record, |r| r.container_handle = Some(handle.to_string()))?;
        debug!(handle = %handle, "Container created");

        self.checkpoint(&id)?;
        self.engine.start(&record.container_name)?;
        self.wait_ready(&record.container_name)?;

        self.swap(&record, |r| {
            r.status = EnvironmentStatus::Running;
            r.pending = None;
            r.failure = None;
        })
    }

    /// Rolls back a failed create and leaves the record `Failed`.
    fn fail_create(&self, id: &EnvironmentId, cause: &LifecycleError, created: &Created) -> LifecycleError {
        let container_name = self.config.container_name(id);
        let mut leftover = Vec::new();

        // The engine may have half-created the container even if the call failed.
        if created.container_attempted {
            match tolerate_absent(self.engine.remove_container(&container_name)) {
                Ok(()) => debug!(container = %container_name, "Rolled back container"),
                Err(e) => {
                    error!(container = %container_name, error = %e, "Rollback failed to remove container");
                    leftover.push(format!("container:{container_name}"));
                }
            }
        }
        for volume in created.volumes.iter().rev() {
            if let Err(e) = tolerate_absent(self.engine.remove_volume(volume)) {
                error!(%volume, error = %e, "Rollback failed to remove volume");
                leftover.push(format!("volume:{volume}"));
            }
        }

        let reason = cause.to_string();
        match self.store.load(id) {
            Ok(Some(current)) => {
                let result = self.swap(&current, |r| {
                    r.mark_failed(reason.clone(), leftover.clone());
                    if leftover.is_empty() {
                        r.container_handle = None;
                    }
                });
                if let Err(e) = result {
                    error!(error = %e, "Failed to record create failure");
                }
            }
            Ok(None) => warn!("Record vanished during rollback"),
            Err(e) => error!(error = %e, "Failed to load record during rollback"),
        }

        match cause {
            LifecycleError::Engine(e) if e.is_unavailable() => LifecycleError::EngineUnavailable {
                id: id.to_string(),
                reason: e.to_string(),
            },
            _ => LifecycleError::PartialCreateFailed {
                id: id.to_string(),
                reason,
                leftover,
            },
        }
    }

    /// Swaps the mounts of the existing container and restarts it.
    ///
    /// A stopped container only gets the new mounts; they apply at its next start.
    fn restart_with(
        &self,
        claimed: &EnvironmentRecord,
        mounts: &[ValidatedMount],
        entries: &[MountEntry],
    ) -> Result<EnvironmentRecord, LifecycleError> {
        let name = &claimed.container_name;
        self.checkpoint(&claimed.id)?;
        self.engine.reconfigure_mounts(name, &bind_mounts(mounts))?;
        if claimed.status == EnvironmentStatus::Running {
            self.engine.restart(name)?;
            self.wait_ready(name)?;
        }
        self.swap(claimed, |r| {
            r.mounts = entries.to_vec();
            r.pending = None;
        })
    }

    /// Replaces the container with one using `mounts`, keeping its volumes.
    fn recreate(
        &self,
        claimed: &EnvironmentRecord,
        mounts: &[ValidatedMount],
        entries: &[MountEntry],
        restart_error: Option<&str>,
    ) -> Result<EnvironmentRecord, LifecycleError> {
        let id = claimed.id.clone();
        let start = claimed.status == EnvironmentStatus::Running;
        let record = self.swap(claimed, |r| r.status = EnvironmentStatus::Provisioning)?;

        match self.rebuild(&record, mounts, entries, start) {
            Ok(record) => Ok(record),
            Err(LifecycleError::Interrupted { id }) => Err(LifecycleError::Interrupted { id }),
            Err(e) => {
                let reason = match restart_error {
                    Some(restart) => {
                        format!("recreating the container failed: {e} (after restart failed: {restart})")
                    }
                    None => format!("recreating the container failed: {e}"),
                };
                Err(self.fail_recreate(&id, reason))
            }
        }
    }

    /// Removes the container and builds a new one from `mounts`, starting it
    /// if `start` is set.
    fn rebuild(
        &self,
        record: &EnvironmentRecord,
        mounts: &[ValidatedMount],
        entries: &[MountEntry],
        start: bool,
    ) -> Result<EnvironmentRecord, LifecycleError> {
        let id = &record.id;
        let name = &record.container_name;

        self.checkpoint(id)?;
        match self.engine.stop(name) {
            Ok(()) => {}
            Err(e) if e.is_absent() => debug!("Container already gone"),
            Err(e) => debug!(error = %e, "Stop failed, removing anyway"),
        }
        tolerate_absent(self.engine.remove_container(name))?;
        let record = self.swap(record, |r| {
            r.container_handle = None;
            r.mounts = entries.to_vec();
        })?;

        self.checkpoint(id)?;
        let labels = BTreeMap::from([(ID_LABEL.to_string(), id.to_string())]);
        for volume in &record.volumes {
            self.engine.create_volume(&volume.name, &labels)?;
        }
        let handle = self
            .engine
            .create_container(&self.container_spec(&record, mounts))?;
        let record = self.swap(&record, |r| r.container_handle = Some(handle.to_string()))?;

        let status = if start {
            self.checkpoint(id)?;
            self.engine.start(name)?;
            self.wait_ready(name)?;
            EnvironmentStatus::Running
        } else {
            EnvironmentStatus::Stopped
        };
        self.swap(&record, |r| {
            r.status = status;
            r.pending = None;
        })
    }

    /// Best-effort stop after a start that did not come up.
    fn stop_quietly(&self, container: &str) {
        if let Err(e) = tolerate_absent(self.engine.stop(container)) {
            warn!(%container, error = %e, "Failed to stop container that did not become ready");
        }
    }

    /// Removes a half-built replacement container and leaves the record `Failed`.
    /// Volumes stay; they belong to the environment until it is destroyed.
    fn fail_recreate(&self, id: &EnvironmentId, reason: String) -> LifecycleError {
        let name = self.config.container_name(id);
        let mut leftover = Vec::new();
        if let Err(e) = tolerate_absent(self.engine.remove_container(&name)) {
            error!(container = %name, error = %e, "Rollback failed to remove container");
            leftover.push(format!("container:{name}"));
        }

        match self.store.load(id) {
            Ok(Some(current)) => {
                leftover.extend(current.volumes.iter().map(|v| format!("volume:{}", v.name)));
                let result = self.swap(&current, |r| {
                    r.mark_failed(reason.clone(), leftover.clone());
                });
                if let Err(e) = result {
                    error!(error = %e, "Failed to record recreate failure");
                }
            }
            Ok(None) => warn!("Record vanished during rollback"),
            Err(e) => error!(error = %e, "Failed to load record during rollback"),
        }

        LifecycleError::PartialCreateFailed {
            id: id.to_string(),
            reason,
            leftover,
        }
    }

    /// Polls `inspect` until the container runs.
    ///
    /// Never stops at a checkpoint: it runs after the engine was changed,
    /// and the record has to be brought in line with that first.
    fn wait_ready(&self, container: &str) -> Result<(), LifecycleError> {
        let mut last = None;
        for attempt in 0..self.config.readiness_attempts.max(1) {
            if attempt > 0 {
                thread::sleep(self.config.readiness_interval);
            }
            let state = self.engine.inspect(container)?;
            trace!(attempt, %state, "Readiness check");
            match state {
                ContainerState::Running => return Ok(()),
                ContainerState::Exited | ContainerState::Dead => {
                    return Err(EngineError::CommandFailed {
                        operation: "readiness check".to_string(),
                        message: format!("container {container} is {state} after start"),
                    }
                    .into());
                }
                other => last = Some(other),
            }
        }
        Err(EngineError::CommandFailed {
            operation: "readiness check".to_string(),
            message: format!(
                "container {container} not running after {} checks (last state: {})",
                self.config.readiness_attempts,
                last.map_or_else(|| "unknown".to_string(), |s| s.to_string())
            ),
        }
        .into())
    }
}

fn bind_mounts(mounts: &[ValidatedMount]) -> Vec<BindMount> {
    mounts
        .iter()
        .map(|m| BindMount {
            source: m.source_canonical.as_path().to_path_buf(),
            target: m.target.clone(),
            read_only: m.permission.is_read_only(),
        })
        .collect()
}

fn tolerate_absent(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(e) if e.is_absent() => {
            debug!(error = %e, "Resource already absent");
            Ok(())
        }
        other => other,
    }
}

fn ensure_unclaimed(record: &EnvironmentRecord) -> Result<(), StateError> {
    match &record.pending {
        Some(pending) if !pending.is_abandoned() => Err(StateError::Conflict {
            id: record.id.to_string(),
            detail: format!(
                "pid {} has been working on it since {}",
                pending.owner_pid,
                pending.started_at.to_rfc3339()
            ),
        }),
        _ => Ok(()),
    }
}

fn invalid_transition(record: &EnvironmentRecord, operation: &str) -> LifecycleError {
    LifecycleError::InvalidTransition {
        id: record.id.to_string(),
        operation: operation.to_string(),
        status: record.status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref() {
        assert!(ImageRef::new("ubuntu:24.04").is_ok());
        assert!(ImageRef::new("ghcr.io/org/dev-env@sha256:abc123").is_ok());

        for bad in ["", "-v", "ubuntu latest", "img;rm", "img$(x)", "img\n"] {
            let err = ImageRef::new(bad).unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidImage { .. }), "{bad:?}");
        }
    }

    #[test]
    fn test_names_derive_from_id() {
        let config = LifecycleConfig::default();
        let id = EnvironmentId::new("demo").unwrap();
        assert_eq!(config.container_name(&id), "tempenv-demo");

        let volumes = config.volume_entries(&id);
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "tempenv-demo-cache");
        assert_eq!(volumes[0].target, PathBuf::from("/home/developer/.cache"));
    }

    #[test]
    fn test_selector() {
        let entry = MountEntry {
            source: PathBuf::from("/tmp/a"),
            target: PathBuf::from("/work"),
            permission: crate::mounts::MountPermission::ReadWrite,
        };
        assert!(MountSelector::All.matches(&entry));
        assert!(MountSelector::Paths(vec![PathBuf::from("/work")]).matches(&entry));
        assert!(MountSelector::Paths(vec![PathBuf::from("/tmp/a")]).matches(&entry));
        assert!(!MountSelector::Paths(vec![PathBuf::from("/extra")]).matches(&entry));
    }
}
