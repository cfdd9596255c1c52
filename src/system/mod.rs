//! System requirements validation.
//!
//! This module provides functions to check that the host can run tempenv:
//! a supported platform, a reachable container engine and a writable
//! state directory.

mod requirements;

pub use requirements::{
    SUPPORTED_PLATFORMS, SystemRequirements, check_all, check_engine_installed,
    check_engine_running, check_platform, check_state_dir,
};
