//! Cleanup on interrupt, termination, hangup, quit and normal exit.
//!
//! [`install_cleanup_handlers`] routes SIGINT, SIGTERM and SIGHUP to a
//! dedicated thread (via `ctrlc`); SIGQUIT is re-raised as SIGTERM so it
//! takes the same path. The thread marks the process as interrupted, waits
//! for open [`CriticalSection`]s to close, sweeps every registered
//! [`TempFileRegistry`] and exits with status 130.
//!
//! Normal exit is covered by the returned [`CleanupGuard`], which sweeps
//! when dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::tempfiles::TempFileRegistry;

/// Exit status used after an interrupt.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// How long the handler waits for critical sections before exiting anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interrupt flag plus a count of sections that must not be cut short.
///
/// Long operations hold a [`CriticalSection`] and call [`checkpoint`]
/// between steps; the signal thread waits for the count to reach zero
/// before it sweeps and exits.
///
/// [`checkpoint`]: InterruptState::checkpoint
#[derive(Debug, Default)]
pub struct InterruptState {
    interrupted: AtomicBool,
    active: Mutex<usize>,
    drained: Condvar,
}

impl InterruptState {
    /// A fresh, un-interrupted state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The state the signal handlers trip.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<InterruptState>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Marks the process as interrupted.
    pub fn trip(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// True once [`trip`](Self::trip) has been called.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Returns `false` if an interrupt is pending.
    ///
    /// Callers stop at this point and return, leaving whatever they persisted
    /// so far in place.
    #[must_use]
    pub fn checkpoint(&self) -> bool {
        !self.is_interrupted()
    }

    /// Opens a section the signal thread will wait for.
    pub fn critical(&self) -> CriticalSection<'_> {
        *self.count() += 1;
        CriticalSection { state: self }
    }

    /// Number of open critical sections.
    #[must_use]
    pub fn active_sections(&self) -> usize {
        *self.count()
    }

    /// Blocks until no critical section is open or `timeout` passes.
    ///
    /// Returns `true` if drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.count();
        while *active > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            active = self
                .drained
                .wait_timeout(active, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard returned by [`InterruptState::critical`].
#[derive(Debug)]
pub struct CriticalSection<'a> {
    state: &'a InterruptState,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        let mut active = self.state.count();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.state.drained.notify_all();
        }
    }
}

/// Sweeps its registry when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard sweeps immediately"]
pub struct CleanupGuard {
    registry: Arc<TempFileRegistry>,
}

impl CleanupGuard {
    /// A guard for `registry` without installing any signal handler.
    pub fn new(registry: Arc<TempFileRegistry>) -> Self {
        Self { registry }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Err(e) = self.registry.sweep() {
            warn!(error = %e, "Temp file cleanup at exit was incomplete");
        }
    }
}

fn registries() -> MutexGuard<'static, Vec<Arc<TempFileRegistry>>> {
    static REGISTRIES: Mutex<Vec<Arc<TempFileRegistry>>> = Mutex::new(Vec::new());
    REGISTRIES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sweeps every registry known to the signal handlers.
pub fn sweep_all() {
    let registries: Vec<_> = registries().iter().cloned().collect();
    for registry in registries {
        if let Err(e) = registry.sweep() {
            warn!(error = %e, "Temp file cleanup was incomplete");
        }
    }
}

/// Installs the process signal handlers (once) and registers `registry`
/// with them.
///
/// May be called again with other registries; handlers are only installed
/// the first time.
pub fn install_cleanup_handlers(
    registry: Arc<TempFileRegistry>,
) -> Result<CleanupGuard, RegistryError> {
    static INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

    {
        let mut known = registries();
        if !known.iter().any(|r| Arc::ptr_eq(r, &registry)) {
            known.push(Arc::clone(&registry));
        }
    }

    INSTALLED
        .get_or_init(install)
        .clone()
        .map_err(|reason| RegistryError::HandlerInstall { reason })?;

    Ok(CleanupGuard::new(registry))
}

fn install() -> Result<(), String> {
    ctrlc::set_handler(|| {
        let state = InterruptState::global();
        state.trip();
        debug!("Interrupt received, waiting for in-flight work to reach a checkpoint");
        if !state.wait_drained(DRAIN_TIMEOUT) {
            warn!(
                active = state.active_sections(),
                "Timed out waiting for in-flight work"
            );
        }
        sweep_all();
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
    .map_err(|e| e.to_string())?;

    forward_quit_to_term().map_err(|e| format!("SIGQUIT: {e}"))
}

/// SIGQUIT has no slot in `ctrlc`; turn it into a SIGTERM, which does.
#[allow(unsafe_code)]
fn forward_quit_to_term() -> nix::Result<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, raise, sigaction};

    extern "C" fn on_quit(_: nix::libc::c_int) {
        // raise(2) is async-signal-safe
        let _ = raise(Signal::SIGTERM);
    }

    let action = SigAction::new(
        SigHandler::Handler(on_quit),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only calls raise(2).
    unsafe { sigaction(Signal::SIGQUIT, &action) }.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_checkpoint_follows_trip() {
        let state = InterruptState::new();
        assert!(state.checkpoint());
        state.trip();
        assert!(!state.checkpoint());
        assert!(state.is_interrupted());
    }

    #[test]
    fn test_critical_sections_drain() {
        let state = Arc::new(InterruptState::new());
        let guard = state.critical();
        assert_eq!(state.active_sections(), 1);
        assert!(!state.wait_drained(Duration::from_millis(10)));

        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_drained(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
        assert_eq!(state.active_sections(), 0);
    }

    #[test]
    fn test_cleanup_guard_sweeps_on_drop() {
        let dir = std::env::temp_dir()
            .join("tempenv-signals-test")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let registry = Arc::new(TempFileRegistry::with_dir(&dir));
        let path = registry.create_temp_file("guard").unwrap();

        drop(CleanupGuard::new(Arc::clone(&registry)));
        assert!(!path.exists());
        assert!(registry.tracked().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
