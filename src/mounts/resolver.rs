//! Turning requested mounts into a validated, ordered mount set.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use tracing::{debug, instrument, warn};

use crate::error::{MountSetError, SecurityError};
use crate::mounts::{MountPermission, MountSpec};
use crate::security::{
    CanonicalPath, PathSecurityValidator, ValidatorConfig, find_dangerous_character,
};

/// Container path tempenv keeps its own bookkeeping under.
pub const CONTAINER_STATE_DIR: &str = "/.tempenv";

/// A mount whose source passed validation.
///
/// Not persisted as-is; `validated_at` only means something inside the
/// process that performed the validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMount {
    pub source_canonical: CanonicalPath,
    pub target: PathBuf,
    pub permission: MountPermission,
    pub validated_at: Instant,
}

impl ValidatedMount {
    /// Validates the canonical source again, right before it is used.
    ///
    /// Fails with `SecurityError::SourceChanged` if it now resolves
    /// elsewhere, or with whatever rule the new resolution violates.
    pub fn revalidate(&self, validator: &PathSecurityValidator) -> Result<Self, SecurityError> {
        let fresh = validator.validate_path(self.source_canonical.as_path())?;
        if fresh != self.source_canonical {
            return Err(SecurityError::SourceChanged {
                path: self.source_canonical.to_string(),
            });
        }
        Ok(Self {
            validated_at: Instant::now(),
            ..self.clone()
        })
    }

    /// The spec that reproduces this mount.
    #[must_use]
    pub fn to_spec(&self) -> MountSpec {
        MountSpec::new(
            self.source_canonical.as_path(),
            self.target.clone(),
            self.permission,
        )
    }
}

/// A target that appeared more than once; the later spec won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOverride {
    pub target: PathBuf,
    /// Index of the spec that was dropped.
    pub replaced: usize,
    /// Index of the spec that was kept.
    pub kept: usize,
}

/// Result of [`MountSetResolver::resolve_detailed`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub mounts: Vec<ValidatedMount>,
    pub overrides: Vec<TargetOverride>,
}

/// Configuration for [`MountSetResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub validator: ValidatorConfig,
    /// Container paths no mount may use or nest under.
    pub reserved_targets: Vec<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            validator: ValidatorConfig::default(),
            reserved_targets: vec![PathBuf::from(CONTAINER_STATE_DIR)],
        }
    }
}

impl ResolverConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_reserved_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.reserved_targets.push(target.into());
        self
    }
}

/// Validates and deduplicates mount sets, all or nothing.
#[derive(Debug, Clone)]
pub struct MountSetResolver {
    validator: PathSecurityValidator,
    reserved: Vec<PathBuf>,
}

impl Default for MountSetResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl MountSetResolver {
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            validator: PathSecurityValidator::new(config.validator),
            reserved: config
                .reserved_targets
                .iter()
                .map(|t| normalize_target(t))
                .collect(),
        }
    }

    /// The validator sources go through.
    #[must_use]
    pub fn validator(&self) -> &PathSecurityValidator {
        &self.validator
    }

    /// Resolves `specs` into an ordered mount set.
    ///
    /// The first invalid spec fails the whole call. When two specs share a
    /// target the later one wins (with a warning) and takes the later
    /// position; other entries keep their relative order.
    pub fn resolve(&self, specs: &[MountSpec]) -> Result<Vec<ValidatedMount>, MountSetError> {
        self.resolve_detailed(specs).map(|r| r.mounts)
    }

    /// Like [`resolve`](Self::resolve), also reporting overridden targets.
    #[instrument(skip_all, fields(count = specs.len()))]
    pub fn resolve_detailed(&self, specs: &[MountSpec]) -> Result<Resolution, MountSetError> {
        let mut validated = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let mount = self.resolve_one(spec).map_err(|source| MountSetError {
                index,
                spec: spec.to_string(),
                source,
            })?;
            validated.push(mount);
        }

        let mut overrides = Vec::new();
        let mut keep = vec![true; validated.len()];
        for later in 0..validated.len() {
            for earlier in 0..later {
                if keep[earlier] && validated[earlier].target == validated[later].target {
                    warn!(
                        mount_target = %validated[later].target.display(),
                        replaced = earlier,
                        kept = later,
                        "Mount target given twice; the later mount overrides the earlier one"
                    );
                    keep[earlier] = false;
                    overrides.push(TargetOverride {
                        target: validated[later].target.clone(),
                        replaced: earlier,
                        kept: later,
                    });
                }
            }
        }

        let mounts: Vec<_> = validated
            .into_iter()
            .zip(keep)
            .filter_map(|(m, k)| k.then_some(m))
            .collect();
        debug!(resolved = mounts.len(), "Mount set resolved");
        Ok(Resolution { mounts, overrides })
    }

    /// Re-validates an already resolved set, immediately before use.
    pub fn revalidate(
        &self,
        mounts: &[ValidatedMount],
    ) -> Result<Vec<ValidatedMount>, MountSetError> {
        mounts
            .iter()
            .enumerate()
            .map(|(index, mount)| {
                mount
                    .revalidate(&self.validator)
                    .map_err(|source| MountSetError {
                        index,
                        spec: mount.to_spec().to_string(),
                        source,
                    })
            })
            .collect()
    }

    fn resolve_one(&self, spec: &MountSpec) -> Result<ValidatedMount, SecurityError> {
        let target = self.validate_target(&spec.target)?;
        let source_canonical = self.validator.validate_path(&spec.source)?;
        Ok(ValidatedMount {
            source_canonical,
            target,
            permission: spec.permission,
            validated_at: Instant::now(),
        })
    }

    /// Checks a container-side target and returns its normalised form.
    pub fn validate_target(&self, target: &Path) -> Result<PathBuf, SecurityError> {
        let display = target.display().to_string();
        let invalid = |reason: &str| SecurityError::InvalidTarget {
            target: display.clone(),
            reason: reason.to_string(),
        };

        let Some(text) = target.to_str() else {
            return Err(invalid("not valid UTF-8"));
        };
        if text.is_empty() {
            return Err(invalid("empty"));
        }
        if !target.is_absolute() {
            return Err(invalid("must be an absolute path"));
        }
        if find_dangerous_character(text).is_some() {
            return Err(invalid("contains a forbidden character"));
        }
        // Separators of the engine's --mount and -v syntax.
        if text.contains(',') || text.contains(':') {
            return Err(invalid("must not contain ',' or ':'"));
        }
        if target.components().any(|c| c == Component::ParentDir) {
            return Err(invalid("must not contain '..'"));
        }

        let normalized = normalize_target(target);
        if normalized.parent().is_none() {
            return Err(invalid("cannot be the container root"));
        }
        if let Some(reserved) = self.reserved.iter().find(|r| normalized.starts_with(r)) {
            return Err(SecurityError::ReservedTarget {
                target: display,
                reserved: reserved.display().to_string(),
            });
        }
        Ok(normalized)
    }
}

/// Drops `.` components, repeated and trailing slashes.
fn normalize_target(target: &Path) -> PathBuf {
    target
        .components()
        .filter(|c| *c != Component::CurDir)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("tempenv-resolver-test")
            .join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&dir).expect("failed to create scratch dir");
        dir
    }

    #[test]
    fn test_target_rules() {
        let resolver = MountSetResolver::default();
        for bad in ["", "relative", "/", "/a/../b", "/a:b", "/a,b", "/a;b", "//."] {
            assert!(
                matches!(
                    resolver.validate_target(Path::new(bad)),
                    Err(SecurityError::InvalidTarget { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(
            resolver.validate_target(Path::new("/work/./src/")).unwrap(),
            PathBuf::from("/work/src")
        );
    }

    #[test]
    fn test_reserved_targets() {
        let resolver =
            MountSetResolver::new(ResolverConfig::default().with_reserved_target("/home/dev/.cache"));
        for reserved in ["/.tempenv", "/.tempenv/state", "/home/dev/.cache/pip"] {
            assert!(
                matches!(
                    resolver.validate_target(Path::new(reserved)),
                    Err(SecurityError::ReservedTarget { .. })
                ),
                "{reserved} should be reserved"
            );
        }
        assert!(resolver.validate_target(Path::new("/.tempenvx")).is_ok());
        assert!(resolver.validate_target(Path::new("/home/dev")).is_ok());
    }

    #[test]
    fn test_duplicate_targets_later_wins() {
        let dir = scratch();
        for name in ["a", "b", "c"] {
            fs::create_dir_all(dir.join(name)).unwrap();
        }
        let specs = vec![
            MountSpec::new(dir.join("a"), "/work", MountPermission::ReadWrite),
            MountSpec::new(dir.join("b"), "/extra", MountPermission::ReadOnly),
            MountSpec::new(dir.join("c"), "/work/", MountPermission::ReadOnly),
        ];

        let resolution = MountSetResolver::default()
            .resolve_detailed(&specs)
            .expect("should resolve");
        let targets: Vec<_> = resolution.mounts.iter().map(|m| m.target.clone()).collect();
        assert_eq!(targets, vec![PathBuf::from("/extra"), PathBuf::from("/work")]);
        assert_eq!(
            resolution.mounts[1].source_canonical.as_path(),
            fs::canonicalize(dir.join("c")).unwrap()
        );
        assert_eq!(
            resolution.overrides,
            vec![TargetOverride {
                target: PathBuf::from("/work"),
                replaced: 0,
                kept: 2,
            }]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_error_identifies_offending_spec() {
        let dir = scratch();
        let specs = vec![
            MountSpec::new(&dir, "/ok", MountPermission::ReadWrite),
            MountSpec::new("/tmp/tempenv-missing-ba5e", "/missing", MountPermission::ReadWrite),
        ];
        let err = MountSetResolver::default().resolve(&specs).unwrap_err();
        assert_eq!(err.index, 1);
        assert!(err.spec.contains("/missing"));
        assert!(matches!(err.source, SecurityError::PathNotFound { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_revalidate_detects_swapped_source() {
        let dir = scratch();
        let real = dir.join("real");
        let other = dir.join("other");
        fs::create_dir_all(&real).unwrap();
        fs::create_dir_all(&other).unwrap();

        let resolver = MountSetResolver::default();
        let mounts = resolver
            .resolve(&[MountSpec::new(&real, "/work", MountPermission::ReadWrite)])
            .unwrap();
        assert!(resolver.revalidate(&mounts).is_ok());

        let canonical_real = mounts[0].source_canonical.as_path().to_path_buf();
        fs::remove_dir(&canonical_real).unwrap();
        std::os::unix::fs::symlink(&other, &canonical_real).unwrap();

        let err = resolver.revalidate(&mounts).unwrap_err();
        assert!(matches!(err.source, SecurityError::SourceChanged { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_revalidate_detects_swap_to_system_path() {
        let dir = scratch();
        let real = dir.join("real");
        fs::create_dir_all(&real).unwrap();

        let resolver = MountSetResolver::default();
        let mounts = resolver
            .resolve(&[MountSpec::new(&real, "/work", MountPermission::ReadWrite)])
            .unwrap();

        let canonical_real = mounts[0].source_canonical.as_path().to_path_buf();
        fs::remove_dir(&canonical_real).unwrap();
        std::os::unix::fs::symlink("/etc", &canonical_real).unwrap();

        let err = resolver.revalidate(&mounts).unwrap_err();
        assert!(matches!(err.source, SecurityError::SystemPathForbidden { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_revalidate_refreshes_validation_time() {
        let dir = scratch();
        let resolver = MountSetResolver::default();
        let mounts = resolver
            .resolve(&[MountSpec::new(&dir, "/w", MountPermission::ReadWrite)])
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let fresh = resolver.revalidate(&mounts).unwrap();
        assert!(fresh[0].validated_at > mounts[0].validated_at);
        assert_eq!(fresh[0].source_canonical, mounts[0].source_canonical);
        let _ = fs::remove_dir_all(&dir);
    }
}
