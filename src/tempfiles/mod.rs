//! Temporary files that are guaranteed to be cleaned up.
//!
//! Scratch files (for example the staging file of an atomic state write) are
//! created through a [`TempFileRegistry`]. The registry deletes everything it
//! still tracks when swept, and [`install_cleanup_handlers`] arranges for a
//! sweep on interrupt, termination, hangup, quit and normal exit.
//!
//! # Example
//!
//! ```no_run
//! use tempenv::tempfiles::{TempFileRegistry, install_cleanup_handlers};
//!
//! let registry = TempFileRegistry::global();
//! let _guard = install_cleanup_handlers(registry.clone())?;
//!
//! let scratch = registry.create_temp_file("download")?;
//! // ... use scratch; it is removed on exit or Ctrl-C
//! # Ok::<(), tempenv::error::RegistryError>(())
//! ```

mod registry;
mod signals;

pub use registry::{SweepReport, TEMP_PREFIX, TempFileRegistry, TempKind, TrackedTempEntry};
pub use signals::{
    CleanupGuard, CriticalSection, INTERRUPTED_EXIT_CODE, InterruptState,
    install_cleanup_handlers, sweep_all,
};

pub(crate) use registry::process_exists;
