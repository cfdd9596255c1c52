//! In-memory engine for tests.
//!
//! Failures can be injected per operation, and hooks run at the start of an
//! operation (before the lock is taken) so tests can interleave callers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::{BindMount, ContainerEngine, ContainerHandle, ContainerSpec, ContainerState, VolumeMount};
use crate::error::EngineError;

/// Operations a [`MockEngine`] records and can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MockOp {
    CreateContainer,
    Start,
    Stop,
    RemoveContainer,
    CreateVolume,
    RemoveVolume,
    Inspect,
    Restart,
    ReconfigureMounts,
    Exec,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub op: MockOp,
    /// Container or volume name.
    pub name: String,
}

/// A container held by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    pub id: String,
    pub image: String,
    pub state: ContainerState,
    pub mounts: Vec<BindMount>,
    pub volumes: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    starting_polls: usize,
}

struct Failure {
    op: MockOp,
    error: EngineError,
    persistent: bool,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    volumes: BTreeSet<String>,
    calls: Vec<EngineCall>,
    failures: Vec<Failure>,
    hooks: BTreeMap<MockOp, Hook>,
}

/// A [`ContainerEngine`] that keeps containers and volumes in memory.
pub struct MockEngine {
    state: Mutex<MockState>,
    live_remount: bool,
    ready_after: usize,
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MockEngine")
            .field("containers", &state.containers.keys().collect::<Vec<_>>())
            .field("volumes", &state.volumes)
            .field("live_remount", &self.live_remount)
            .finish_non_exhaustive()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// An empty engine that supports live remounting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            live_remount: true,
            ready_after: 0,
        }
    }

    #[must_use]
    pub fn with_live_remount(mut self, supported: bool) -> Self {
        self.live_remount = supported;
        self
    }

    /// Started containers report `restarting` for the first `polls` inspections.
    #[must_use]
    pub fn with_ready_after(mut self, polls: usize) -> Self {
        self.ready_after = polls;
        self
    }

    /// Fails the next call of `op` with `error`.
    pub fn fail_on(&self, op: MockOp, error: EngineError) {
        self.lock().failures.push(Failure {
            op,
            error,
            persistent: false,
        });
    }

    /// Fails every call of `op` with `error` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: MockOp, error: EngineError) {
        self.lock().failures.push(Failure {
            op,
            error,
            persistent: true,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Runs `hook` at the start of every call of `op`, outside the engine lock.
    pub fn on(&self, op: MockOp, hook: impl Fn() + Send + Sync + 'static) {
        self.lock().hooks.insert(op, Arc::new(hook));
    }

    pub fn clear_hooks(&self) {
        self.lock().hooks.clear();
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of calls of `op` so far.
    #[must_use]
    pub fn count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    #[must_use]
    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.lock().containers.get(name).cloned()
    }

    #[must_use]
    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    #[must_use]
    pub fn volume_exists(&self, name: &str) -> bool {
        self.lock().volumes.contains(name)
    }

    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        self.lock().volumes.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call, runs its hook, then returns the state lock or an injected failure.
    fn enter(&self, op: MockOp, name: &str) -> Result<MutexGuard<'_, MockState>, EngineError> {
        let hook = {
            let mut state = self.lock();
            state.calls.push(EngineCall {
                op,
                name: name.to_string(),
            });
            state.hooks.get(&op).cloned()
        };
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.lock();
        if let Some(pos) = state.failures.iter().position(|f| f.op == op) {
            let error = state.failures[pos].error.clone();
            if !state.failures[pos].persistent {
                state.failures.remove(pos);
            }
            return Err(error);
        }
        Ok(state)
    }
}

fn missing(kind: &'static str, name: &str) -> EngineError {
    EngineError::NotFound {
        kind,
        name: name.to_string(),
    }
}

impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError> {
        let mut state = self.enter(MockOp::CreateContainer, &spec.name)?;
        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::CommandFailed {
                operation: "mock create".to_string(),
                message: format!("container name {} is already in use", spec.name),
            });
        }
        for volume in &spec.volumes {
            state.volumes.insert(volume.name.clone());
        }
        let id = format!("mock-{}", Uuid::new_v4().simple());
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                image: spec.image.clone(),
                state: ContainerState::Created,
                mounts: spec.mounts.clone(),
                volumes: spec.volumes.clone(),
                labels: spec.labels.clone(),
                starting_polls: 0,
            },
        );
        Ok(ContainerHandle(id))
    }

    fn start(&self, container: &str) -> Result<(), EngineError> {
        let mut state = self.enter(MockOp::Start, container)?;
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("container", container))?;
        entry.state = ContainerState::Running;
        entry.starting_polls = self.ready_after;
        Ok(())
    }

    fn stop(&self, container: &str) -> Result<(), EngineError> {
        let mut state = self.enter(MockOp::Stop, container)?;
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("container", container))?;
        entry.state = ContainerState::Exited;
        Ok(())
    }

    fn remove_container(&self, container: &str) -> Result<(), EngineError> {
        let mut state = self.enter(MockOp::RemoveContainer, container)?;
        state
            .containers
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| missing("container", container))
    }

    fn create_volume(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        let mut state = self.enter(MockOp::CreateVolume, name)?;
        state.volumes.insert(name.to_string());
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.enter(MockOp::RemoveVolume, name)?;
        let in_use = state
            .containers
            .values()
            .any(|c| c.volumes.iter().any(|v| v.name == name));
        if in_use {
            return Err(EngineError::CommandFailed {
                operation: "mock volume rm".to_string(),
                message: format!("volume {name} is in use"),
            });
        }
        if state.volumes.remove(name) {
            Ok(())
        } else {
            Err(missing("volume", name))
        }
    }

    fn inspect(&self, container: &str) -> Result<ContainerState, EngineError> {
        let mut state = self.enter(MockOp::Inspect, container)?;
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("container", container))?;
        if entry.state.is_running() && entry.starting_polls > 0 {
            entry.starting_polls -= 1;
            return Ok(ContainerState::Restarting);
        }
        Ok(entry.state.clone())
    }

    fn restart(&self, container: &str) -> Result<(), EngineError> {
        let mut state = self.enter(MockOp::Restart, container)?;
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("container", container))?;
        entry.state = ContainerState::Running;
        entry.starting_polls = self.ready_after;
        Ok(())
    }

    fn exec_interactive(&self, container: &str, _command: &[String]) -> Result<i32, EngineError> {
        let state = self.enter(MockOp::Exec, container)?;
        let entry = state
            .containers
            .get(container)
            .ok_or_else(|| missing("container", container))?;
        if !entry.state.is_running() {
            return Err(EngineError::CommandFailed {
                operation: "mock exec".to_string(),
                message: format!("container {container} is not running"),
            });
        }
        Ok(0)
    }

    fn supports_live_remount(&self) -> bool {
        self.live_remount
    }

    fn reconfigure_mounts(&self, container: &str, mounts: &[BindMount]) -> Result<(), EngineError> {
        if !self.live_remount {
            return Err(EngineError::Unsupported {
                engine: self.name().to_string(),
                operation: "reconfiguring mounts",
            });
        }
        let mut state = self.enter(MockOp::ReconfigureMounts, container)?;
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("container", container))?;
        entry.mounts = mounts.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "ubuntu:24.04".to_string(),
            mounts: vec![BindMount {
                source: PathBuf::from("/tmp/a"),
                target: PathBuf::from("/work"),
                read_only: false,
            }],
            volumes: vec![VolumeMount {
                name: format!("{name}-cache"),
                target: PathBuf::from("/cache"),
            }],
            labels: BTreeMap::new(),
            workdir: None,
            command: Vec::new(),
        }
    }

    #[test]
    fn test_container_lifecycle() {
        let engine = MockEngine::new();
        engine.create_container(&spec("c1")).unwrap();
        assert_eq!(engine.inspect("c1").unwrap(), ContainerState::Created);

        engine.start("c1").unwrap();
        assert!(engine.inspect("c1").unwrap().is_running());

        engine.stop("c1").unwrap();
        assert_eq!(engine.inspect("c1").unwrap(), ContainerState::Exited);

        engine.remove_container("c1").unwrap();
        assert!(engine.remove_container("c1").unwrap_err().is_absent());
        assert!(engine.container("c1").is_none());
    }

    #[test]
    fn test_volume_in_use_cannot_be_removed() {
        let engine = MockEngine::new();
        engine.create_container(&spec("c1")).unwrap();
        assert!(engine.volume_exists("c1-cache"));
        assert!(engine.remove_volume("c1-cache").is_err());

        engine.remove_container("c1").unwrap();
        engine.remove_volume("c1-cache").unwrap();
        assert!(engine.remove_volume("c1-cache").unwrap_err().is_absent());
    }

    #[test]
    fn test_one_shot_failure() {
        let engine = MockEngine::new();
        engine.fail_on(MockOp::Start, EngineError::PermissionDenied);
        engine.create_container(&spec("c1")).unwrap();

        assert_eq!(engine.start("c1").unwrap_err(), EngineError::PermissionDenied);
        engine.start("c1").unwrap();
        assert_eq!(engine.count(MockOp::Start), 2);
    }

    #[test]
    fn test_persistent_failure() {
        let engine = MockEngine::new();
        engine.fail_always(
            MockOp::CreateVolume,
            EngineError::Unavailable {
                reason: "down".to_string(),
            },
        );
        assert!(engine.create_volume("v", &BTreeMap::new()).is_err());
        assert!(engine.create_volume("v", &BTreeMap::new()).is_err());

        engine.clear_failures();
        engine.create_volume("v", &BTreeMap::new()).unwrap();
    }

    #[test]
    fn test_hook_runs_per_call() {
        let engine = MockEngine::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        engine.on(MockOp::Inspect, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _ = engine.inspect("missing");
        let _ = engine.inspect("missing");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ready_after() {
        let engine = MockEngine::new().with_ready_after(2);
        engine.create_container(&spec("c1")).unwrap();
        engine.start("c1").unwrap();

        assert_eq!(engine.inspect("c1").unwrap(), ContainerState::Restarting);
        assert_eq!(engine.inspect("c1").unwrap(), ContainerState::Restarting);
        assert!(engine.inspect("c1").unwrap().is_running());
    }

    #[test]
    fn test_exec_needs_running_container() {
        let engine = MockEngine::new();
        engine.create_container(&spec("c1")).unwrap();
        assert!(engine.exec_interactive("c1", &[]).is_err());

        engine.start("c1").unwrap();
        assert_eq!(engine.exec_interactive("c1", &[]).unwrap(), 0);
        assert!(engine.exec_interactive("c2", &[]).unwrap_err().is_absent());
        assert_eq!(engine.count(MockOp::Exec), 3);
    }

    #[test]
    fn test_reconfigure_requires_support() {
        let engine = MockEngine::new().with_live_remount(false);
        engine.create_container(&spec("c1")).unwrap();
        let err = engine.reconfigure_mounts("c1", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported { .. }));

        let engine = MockEngine::new();
        engine.create_container(&spec("c1")).unwrap();
        engine.reconfigure_mounts("c1", &[]).unwrap();
        assert!(engine.container("c1").unwrap().mounts.is_empty());
    }
}
