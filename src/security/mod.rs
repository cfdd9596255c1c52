//! Host path validation for mount sources.
//!
//! Every host path that may be bind-mounted into an environment goes through
//! [`PathSecurityValidator`] first. The validator is configured explicitly
//! with a [`ValidatorConfig`]; there is no process-wide policy.
//!
//! # Checks
//!
//! In order:
//!
//! 1. The raw input and its NFKC-normalised form are scanned for null bytes,
//!    control characters, invisible formatting characters and shell
//!    metacharacters (`;`, `|`, `&`, `$`, backtick, quotes, parentheses,
//!    `<`, `>` and newline).
//! 2. Relative inputs are anchored to the configured base directory.
//! 3. The path is canonicalised against the live filesystem. Missing paths
//!    fail here.
//! 4. The canonical form is scanned again, then matched against the denied
//!    system roots (the filesystem root itself is always denied).
//! 5. If the input contained `..`, the canonical form must stay under the
//!    directory the `..` segments started from.
//! 6. If allowed roots are configured, the canonical form must sit under one.
//!
//! A successful validation yields a [`CanonicalPath`], which can only be
//! obtained this way.
//!
//! # Example
//!
//! ```no_run
//! use tempenv::security::{PathSecurityValidator, ValidatorConfig};
//!
//! let validator = PathSecurityValidator::new(ValidatorConfig::default());
//! let canonical = validator.validate("/tmp/project").unwrap();
//! println!("{canonical}");
//! ```

mod characters;
mod validator;

pub use characters::{find_dangerous_character, is_dangerous_character};
pub use validator::PathSecurityValidator;

use std::fmt;
use std::path::{Path, PathBuf};

/// System roots no mount source may resolve into.
pub const DEFAULT_DENIED_ROOTS: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/boot", "/sys", "/proc", "/dev", "/lib", "/lib64",
];

/// Configuration for [`PathSecurityValidator`].
///
/// # Example
///
/// ```
/// use tempenv::security::ValidatorConfig;
///
/// let config = ValidatorConfig::default()
///     .with_denied_root("/var/lib/docker")
///     .with_base_dir("/home/dev/project");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Path prefixes that are always refused after resolution.
    pub denied_roots: Vec<PathBuf>,
    /// If non-empty, resolved paths must lie under one of these.
    pub allowed_roots: Vec<PathBuf>,
    /// Directory relative inputs are resolved against. `None` means the
    /// process working directory at validation time.
    pub base_dir: Option<PathBuf>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            denied_roots: DEFAULT_DENIED_ROOTS.iter().map(PathBuf::from).collect(),
            allowed_roots: Vec::new(),
            base_dir: None,
        }
    }
}

impl ValidatorConfig {
    /// Creates a configuration with the default system denylist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root to the denylist.
    #[must_use]
    pub fn with_denied_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.denied_roots.push(root.into());
        self
    }

    /// Confines validation to paths under `root` (may be called repeatedly).
    #[must_use]
    pub fn with_allowed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.allowed_roots.push(root.into());
        self
    }

    /// Sets the directory relative inputs are anchored to.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }
}

/// A fully resolved, symlink-free absolute path that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self(path)
    }

    /// Borrows the path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Consumes the wrapper.
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
