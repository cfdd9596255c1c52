//! System requirements checking implementation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::DockerCli;
use crate::error::{EngineError, Result, SystemRequirementsError};

/// Platforms tempenv runs on (`uname -s`).
pub const SUPPORTED_PLATFORMS: &[&str] = &["Linux", "Darwin"];

/// Limit for each engine check.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Results of all system requirements checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Operating system name (e.g., "Linux")
    pub platform: String,
    /// Kernel release string (e.g., "6.8.0-45-generic")
    pub kernel_version: String,
    /// Engine binary that was checked
    pub engine: String,
    /// First line of `<engine> --version`
    pub engine_version: String,
    /// State directory that was found writable
    pub state_dir: PathBuf,
}

/// Check all system requirements and return detailed results.
///
/// Returns `Ok(SystemRequirements)` with all check results, or
/// `Err` with the first failing requirement.
pub fn check_all(engine: &str, state_dir: &Path) -> Result<SystemRequirements> {
    let (platform, kernel_version) = check_platform()?;
    let engine_version = check_engine_installed(engine)?;
    check_engine_running(engine)?;
    check_state_dir(state_dir)?;

    Ok(SystemRequirements {
        platform,
        kernel_version,
        engine: engine.to_string(),
        engine_version,
        state_dir: state_dir.to_path_buf(),
    })
}

/// Check the host runs a supported Unix.
///
/// # Returns
///
/// Tuple of (platform, kernel release) on success.
pub fn check_platform() -> Result<(String, String)> {
    let uname = nix::sys::utsname::uname().map_err(|e| SystemRequirementsError::ReadFailed {
        context: "uname syscall".to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    let platform = uname.sysname().to_string_lossy().to_string();
    if !SUPPORTED_PLATFORMS.contains(&platform.as_str()) {
        return Err(SystemRequirementsError::UnsupportedPlatform { found: platform }.into());
    }

    let release = uname.release().to_string_lossy().to_string();
    Ok((platform, release))
}

/// Check the engine binary can be run.
///
/// Returns the first line of `<engine> --version`.
pub fn check_engine_installed(engine: &str) -> Result<String> {
    let cli = DockerCli::new(engine).with_timeout(PROBE_TIMEOUT);
    let not_installed = || SystemRequirementsError::EngineNotInstalled {
        engine: engine.to_string(),
    };

    let output = cli
        .execute(&["--version".to_string()])
        .map_err(|_| not_installed())?;
    if !output.success() {
        return Err(not_installed().into());
    }

    Ok(output
        .stdout
        .lines()
        .next()
        .map_or_else(|| "unknown".to_string(), |line| line.trim().to_string()))
}

/// Check the engine daemon answers `<engine> info`.
///
/// A daemon that refuses the current user is reported separately from one
/// that is not running.
pub fn check_engine_running(engine: &str) -> Result<()> {
    let cli = DockerCli::new(engine).with_timeout(PROBE_TIMEOUT);
    let output = match cli.execute(&["info".to_string()]) {
        Ok(output) => output,
        Err(EngineError::Unavailable { .. }) => {
            return Err(SystemRequirementsError::EngineNotInstalled {
                engine: engine.to_string(),
            }
            .into());
        }
        Err(_) => {
            return Err(SystemRequirementsError::EngineNotRunning {
                engine: engine.to_string(),
            }
            .into());
        }
    };

    if output.success() {
        return Ok(());
    }
    if output.stderr.to_ascii_lowercase().contains("permission denied") {
        return Err(SystemRequirementsError::EnginePermission {
            engine: engine.to_string(),
        }
        .into());
    }
    Err(SystemRequirementsError::EngineNotRunning {
        engine: engine.to_string(),
    }
    .into())
}

/// Check the state directory exists (creating it if needed) and accepts writes.
pub fn check_state_dir(state_dir: &Path) -> Result<()> {
    let not_writable = |source| SystemRequirementsError::StateDirNotWritable {
        path: state_dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(state_dir).map_err(not_writable)?;
    let mut scratch = tempfile::tempfile_in(state_dir).map_err(not_writable)?;
    scratch.write_all(b"tempenv").map_err(not_writable)?;
    Ok(())
}
