//! The path validator itself.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument, trace, warn};

use crate::error::SecurityError;
use crate::security::characters::find_dangerous_character;
use crate::security::{CanonicalPath, ValidatorConfig};

/// Validates candidate host paths for use as mount sources.
///
/// The validator holds no mutable state and is cheap to clone. Each call
/// consults the filesystem as it is at that moment; callers that act on the
/// result later should validate again right before use.
#[derive(Debug, Clone)]
pub struct PathSecurityValidator {
    config: ValidatorConfig,
    /// Denied roots in both their configured and resolved spelling, so a
    /// root that is itself a symlink (`/lib -> usr/lib`) matches either way.
    denied: Vec<PathBuf>,
    allowed: Vec<PathBuf>,
}

impl Default for PathSecurityValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl PathSecurityValidator {
    /// Creates a validator, resolving the configured roots once.
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        let denied = with_resolved(&config.denied_roots);
        let allowed = with_resolved(&config.allowed_roots);
        Self {
            config,
            denied,
            allowed,
        }
    }

    /// Returns the configuration this validator was built from.
    #[must_use]
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validates a textual candidate path.
    ///
    /// # Errors
    ///
    /// - `SecurityError::DangerousCharacters` for metacharacters or control
    ///   characters, in any Unicode compatibility form
    /// - `SecurityError::PathNotFound` if the path cannot be resolved
    /// - `SecurityError::SystemPathForbidden` if it resolves into a denied root
    /// - `SecurityError::TraversalDetected` if `..` escapes its starting point
    /// - `SecurityError::OutsideAllowedRoots` if confined and outside
    #[instrument(skip(self))]
    pub fn validate(&self, candidate: &str) -> Result<CanonicalPath, SecurityError> {
        if candidate.is_empty() {
            return Err(SecurityError::PathNotFound {
                path: String::new(),
            });
        }

        if let Some(found) = find_dangerous_character(candidate) {
            debug!(?found, "Rejected dangerous character");
            return Err(SecurityError::DangerousCharacters {
                path: candidate.to_string(),
                found,
            });
        }

        let input = Path::new(candidate);
        let anchored = self.anchor(input)?;
        trace!(anchored = %anchored.display(), "Anchored candidate");

        let canonical = fs::canonicalize(&anchored).map_err(|e| {
            debug!(error = %e, "Canonicalization failed");
            SecurityError::PathNotFound {
                path: candidate.to_string(),
            }
        })?;

        // The filesystem may hold names the input did not spell out.
        let Some(canonical_str) = canonical.to_str() else {
            return Err(SecurityError::DangerousCharacters {
                path: candidate.to_string(),
                found: char::REPLACEMENT_CHARACTER,
            });
        };
        if let Some(found) = find_dangerous_character(canonical_str) {
            debug!(?found, "Resolved path contains dangerous character");
            return Err(SecurityError::DangerousCharacters {
                path: candidate.to_string(),
                found,
            });
        }

        if self.is_denied(&canonical) {
            debug!("Resolved path is under a denied root");
            return Err(SecurityError::SystemPathForbidden {
                path: candidate.to_string(),
            });
        }

        if let Some(start) = traversal_start(&anchored) {
            let start = fs::canonicalize(&start).map_err(|_| SecurityError::PathNotFound {
                path: candidate.to_string(),
            })?;
            if !canonical.starts_with(&start) {
                debug!("'..' segments escape their starting directory");
                return Err(SecurityError::TraversalDetected {
                    path: candidate.to_string(),
                });
            }
        }

        if !self.allowed.is_empty() && !self.allowed.iter().any(|root| canonical.starts_with(root))
        {
            return Err(SecurityError::OutsideAllowedRoots {
                path: candidate.to_string(),
            });
        }

        warn_if_world_writable(&canonical);

        debug!(canonical = %canonical.display(), "Path validated");
        Ok(CanonicalPath::new(canonical))
    }

    /// Validates a `Path`. Non-UTF-8 paths are rejected.
    ///
    /// # Errors
    ///
    /// Same as [`validate`](Self::validate).
    pub fn validate_path(&self, candidate: &Path) -> Result<CanonicalPath, SecurityError> {
        match candidate.to_str() {
            Some(s) => self.validate(s),
            None => Err(SecurityError::DangerousCharacters {
                path: candidate.to_string_lossy().into_owned(),
                found: char::REPLACEMENT_CHARACTER,
            }),
        }
    }

    fn anchor(&self, input: &Path) -> Result<PathBuf, SecurityError> {
        if input.is_absolute() {
            return Ok(input.to_path_buf());
        }
        let base = match &self.config.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|_| SecurityError::PathNotFound {
                path: input.display().to_string(),
            })?,
        };
        Ok(base.join(input))
    }

    fn is_denied(&self, canonical: &Path) -> bool {
        if canonical.parent().is_none() {
            return true;
        }
        self.denied.iter().any(|root| canonical.starts_with(root))
    }
}

/// Returns the directory formed by the components before the first `..`.
fn traversal_start(path: &Path) -> Option<PathBuf> {
    let mut start = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => return Some(start),
            other => start.push(other),
        }
    }
    None
}

/// Each root as configured plus its resolved form, when different.
fn with_resolved(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::with_capacity(roots.len() * 2);
    for root in roots {
        out.push(root.clone());
        if let Ok(resolved) = fs::canonicalize(root) {
            if &resolved != root {
                out.push(resolved);
            }
        }
    }
    out
}

fn warn_if_world_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode();
        // sticky dirs like /tmp are fine
        if metadata.is_dir() && mode & 0o002 != 0 && mode & 0o1000 == 0 {
            warn!(
                path = %path.display(),
                mode = format!("{:o}", mode),
                "Mount source is world-writable"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("tempenv-security-test")
            .join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&dir).expect("failed to create scratch dir");
        dir
    }

    #[test]
    fn test_tmp_subdirectory_is_allowed() {
        let dir = scratch();
        let validator = PathSecurityValidator::default();
        let canonical = validator
            .validate(dir.to_str().expect("utf-8 path"))
            .expect("should validate");
        assert_eq!(canonical.as_path(), fs::canonicalize(&dir).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_root_is_forbidden() {
        let validator = PathSecurityValidator::default();
        assert!(matches!(
            validator.validate("/"),
            Err(SecurityError::SystemPathForbidden { .. })
        ));
    }

    #[test]
    fn test_system_roots_are_forbidden() {
        let validator = PathSecurityValidator::default();
        for path in ["/etc", "/usr", "/proc", "/sys", "/dev"] {
            assert!(
                matches!(
                    validator.validate(path),
                    Err(SecurityError::SystemPathForbidden { .. })
                ),
                "{path} should be forbidden"
            );
        }
    }

    #[test]
    fn test_missing_path() {
        let validator = PathSecurityValidator::default();
        let err = validator
            .validate("/tmp/tempenv-definitely-missing-7f3a")
            .unwrap_err();
        assert!(matches!(err, SecurityError::PathNotFound { .. }));
        assert!(matches!(
            validator.validate(""),
            Err(SecurityError::PathNotFound { .. })
        ));
    }

    #[test]
    fn test_symlink_into_etc() {
        let dir = scratch();
        let link = dir.join("innocent");
        symlink("/etc", &link).expect("failed to create symlink");

        let validator = PathSecurityValidator::default();
        let err = validator.validate(link.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, SecurityError::SystemPathForbidden { .. }));
        // The message names the input, not the link target.
        assert!(!err.to_string().contains("/etc"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_traversal_out_of_start_dir() {
        let dir = scratch();
        fs::create_dir_all(dir.join("inner")).unwrap();
        fs::create_dir_all(dir.join("sibling")).unwrap();

        let validator = PathSecurityValidator::default();
        let escaping = format!("{}/inner/../sibling", dir.display());
        assert!(matches!(
            validator.validate(&escaping),
            Err(SecurityError::TraversalDetected { .. })
        ));

        let contained = format!("{}/inner/../inner", dir.display());
        assert!(validator.validate(&contained).is_ok());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_traversal_into_system_root_reports_system_path() {
        let dir = scratch();
        let depth = fs::canonicalize(&dir).unwrap().components().count() - 1;
        let ups = "../".repeat(depth);
        let candidate = format!("{}/{ups}etc", dir.display());

        let validator = PathSecurityValidator::default();
        assert!(matches!(
            validator.validate(&candidate),
            Err(SecurityError::SystemPathForbidden { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_relative_paths_use_base_dir() {
        let dir = scratch();
        fs::create_dir_all(dir.join("project")).unwrap();
        fs::create_dir_all(dir.join("other")).unwrap();

        let validator = PathSecurityValidator::new(ValidatorConfig::default().with_base_dir(&dir));
        let canonical = validator.validate("project").expect("relative path");
        assert_eq!(
            canonical.as_path(),
            fs::canonicalize(dir.join("project")).unwrap()
        );

        let inner = PathSecurityValidator::new(
            ValidatorConfig::default().with_base_dir(dir.join("project")),
        );
        assert!(matches!(
            inner.validate("../other"),
            Err(SecurityError::TraversalDetected { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_allowed_roots_confine() {
        let dir = scratch();
        fs::create_dir_all(dir.join("inside")).unwrap();
        let outside = scratch();

        let validator = PathSecurityValidator::new(
            ValidatorConfig::default().with_allowed_root(fs::canonicalize(&dir).unwrap()),
        );
        assert!(validator.validate(dir.join("inside").to_str().unwrap()).is_ok());
        assert!(matches!(
            validator.validate(outside.to_str().unwrap()),
            Err(SecurityError::OutsideAllowedRoots { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
        let _ = fs::remove_dir_all(&outside);
    }

    #[test]
    fn test_extra_denied_root() {
        let dir = scratch();
        let validator =
            PathSecurityValidator::new(ValidatorConfig::default().with_denied_root(&dir));
        assert!(matches!(
            validator.validate(dir.to_str().unwrap()),
            Err(SecurityError::SystemPathForbidden { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_traversal_start() {
        assert_eq!(
            traversal_start(Path::new("/tmp/a/../b")),
            Some(PathBuf::from("/tmp/a"))
        );
        assert_eq!(traversal_start(Path::new("/tmp/a/b")), None);
    }
}
