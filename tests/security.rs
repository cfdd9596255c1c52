//! Integration tests for host path validation and mount set resolution.
//!
//! These tests verify:
//! - Metacharacters are rejected in every Unicode compatibility form
//! - Paths resolving under system roots are rejected, including via symlinks
//! - Fresh /tmp subdirectories are accepted in canonical form
//! - Resolution is all-or-nothing and names the offending mount

use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;

use proptest::prelude::*;
use tempenv::error::SecurityError;
use tempenv::mounts::{MountPermission, MountSetResolver, MountSpec, ResolverConfig};
use tempenv::security::{PathSecurityValidator, ValidatorConfig};

/// Shell metacharacters, their fullwidth forms and their small forms.
const METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '"', '\'', '(', ')', '<', '>', '\n', '\0',
    '\u{FF1B}', '\u{FF5C}', '\u{FF06}', '\u{FF04}', '\u{FF40}', '\u{FF02}', '\u{FF07}',
    '\u{FF08}', '\u{FF09}', '\u{FF1C}', '\u{FF1E}',
    '\u{FE54}', '\u{FE60}', '\u{FE69}', '\u{FE59}', '\u{FE5A}', '\u{FE64}', '\u{FE65}',
];

fn rw(source: impl Into<PathBuf>, target: &str) -> MountSpec {
    MountSpec::new(source, target, MountPermission::ReadWrite)
}

// =============================================================================
// Dangerous Character Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: any metacharacter anywhere in the path is rejected,
    /// whatever surrounds it and whether or not the path exists.
    #[test]
    fn prop_metacharacters_always_rejected(
        head in "[a-zA-Z0-9_./-]{0,20}",
        bad in proptest::sample::select(METACHARACTERS),
        tail in "[a-zA-Z0-9_./-]{0,20}",
    ) {
        let candidate = format!("/tmp/{head}{bad}{tail}");
        let err = PathSecurityValidator::default().validate(&candidate).unwrap_err();
        let is_dangerous = matches!(err, SecurityError::DangerousCharacters { .. });
        prop_assert!(is_dangerous, "{candidate:?} gave {err:?}");
    }
}

#[test]
fn test_command_substitution_rejected() {
    let validator = PathSecurityValidator::default();
    for candidate in ["/tmp/$(whoami)", "/tmp/`id`", "/tmp/a;rm -rf ~", "/tmp/x\u{FF04}\u{FF08}id\u{FF09}"] {
        let err = validator.validate(candidate).unwrap_err();
        assert!(
            matches!(err, SecurityError::DangerousCharacters { .. }),
            "{candidate:?} gave {err:?}"
        );
    }
}

#[test]
fn test_error_names_rule_not_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let link = dir.path().join("innocent");
    symlink("/etc", &link).unwrap();

    let err = PathSecurityValidator::default()
        .validate(link.to_str().unwrap())
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("protected system directory"));
    assert!(message.contains("innocent"));
    assert!(!message.contains("\"/etc\""));
}

// =============================================================================
// System Path Tests
// =============================================================================

#[test]
fn test_system_roots_forbidden() {
    let validator = PathSecurityValidator::default();
    for root in ["/", "/etc", "/usr", "/usr/bin", "/proc", "/sys", "/dev", "/bin"] {
        let err = validator.validate(root).unwrap_err();
        assert!(
            matches!(err, SecurityError::SystemPathForbidden { .. }),
            "{root} gave {err:?}"
        );
    }
}

#[test]
fn test_symlink_into_system_root_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let validator = PathSecurityValidator::default();

    for (name, target) in [("to-etc", "/etc"), ("to-root", "/"), ("to-proc", "/proc/self")] {
        let link = dir.path().join(name);
        symlink(target, &link).unwrap();
        let err = validator.validate(link.to_str().unwrap()).unwrap_err();
        assert!(
            matches!(err, SecurityError::SystemPathForbidden { .. }),
            "{name} gave {err:?}"
        );
    }
}

#[test]
fn test_symlink_chain_into_system_root_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    symlink("/usr", &second).unwrap();
    symlink(&second, &first).unwrap();

    let err = PathSecurityValidator::default()
        .validate(first.to_str().unwrap())
        .unwrap_err();
    assert!(matches!(err, SecurityError::SystemPathForbidden { .. }));
}

// =============================================================================
// Allowed Path Tests
// =============================================================================

#[test]
fn test_tmp_subdirectory_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    fs::create_dir(&project).unwrap();

    let canonical = PathSecurityValidator::default()
        .validate(project.to_str().unwrap())
        .expect("fresh /tmp subdirectory should validate");
    assert_eq!(canonical.as_path(), fs::canonicalize(&project).unwrap());
    assert!(canonical.as_path().is_absolute());
}

#[test]
fn test_symlink_to_allowed_directory_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("real");
    fs::create_dir(&real).unwrap();
    let link = dir.path().join("link");
    symlink(&real, &link).unwrap();

    let canonical = PathSecurityValidator::default()
        .validate(link.to_str().unwrap())
        .unwrap();
    assert_eq!(canonical.as_path(), fs::canonicalize(&real).unwrap());
}

#[test]
fn test_missing_path_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    let err = PathSecurityValidator::default()
        .validate(missing.to_str().unwrap())
        .unwrap_err();
    assert!(matches!(err, SecurityError::PathNotFound { .. }));
}

#[test]
fn test_traversal_out_of_start_detected() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("inner/a")).unwrap();
    fs::create_dir_all(dir.path().join("outside")).unwrap();

    let candidate = format!("{}/inner/a/../../outside", dir.path().display());
    let err = PathSecurityValidator::default()
        .validate(&candidate)
        .unwrap_err();
    assert!(matches!(err, SecurityError::TraversalDetected { .. }));
}

#[test]
fn test_allowed_roots_confine() {
    let allowed = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let validator = PathSecurityValidator::new(
        ValidatorConfig::new().with_allowed_root(allowed.path()),
    );

    assert!(validator.validate(allowed.path().to_str().unwrap()).is_ok());
    let err = validator
        .validate(other.path().to_str().unwrap())
        .unwrap_err();
    assert!(matches!(err, SecurityError::OutsideAllowedRoots { .. }));
}

// =============================================================================
// Mount Set Resolution Tests
// =============================================================================

#[test]
fn test_resolution_rejects_system_path_and_applies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("proj");
    fs::create_dir(&project).unwrap();

    let specs = vec![rw(&project, "/workspace"), rw("/etc", "/etc-leak")];
    let err = MountSetResolver::default().resolve(&specs).unwrap_err();

    assert_eq!(err.index, 1);
    assert!(err.spec.contains("/etc-leak"));
    assert!(matches!(err.source, SecurityError::SystemPathForbidden { .. }));
}

#[test]
fn test_resolution_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    fs::create_dir(&a).unwrap();
    fs::create_dir(&b).unwrap();

    let specs = vec![rw(&a, "/a"), rw(dir.path().join("missing"), "/m"), rw(&b, "/b")];
    let err = MountSetResolver::default().resolve(&specs).unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(err.source, SecurityError::PathNotFound { .. }));
}

#[test]
fn test_resolution_later_target_wins() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a", "b", "c"] {
        fs::create_dir(dir.path().join(name)).unwrap();
    }

    let specs = vec![
        rw(dir.path().join("a"), "/work"),
        rw(dir.path().join("b"), "/extra"),
        MountSpec::new(dir.path().join("c"), "/work", MountPermission::ReadOnly),
    ];
    let resolution = MountSetResolver::default()
        .resolve_detailed(&specs)
        .unwrap();

    let targets: Vec<_> = resolution.mounts.iter().map(|m| m.target.clone()).collect();
    assert_eq!(targets, vec![PathBuf::from("/extra"), PathBuf::from("/work")]);
    assert_eq!(
        resolution.mounts[1].source_canonical.as_path(),
        fs::canonicalize(dir.path().join("c")).unwrap()
    );
    assert_eq!(resolution.mounts[1].permission, MountPermission::ReadOnly);
    assert_eq!(resolution.overrides.len(), 1);
    assert_eq!(resolution.overrides[0].replaced, 0);
    assert_eq!(resolution.overrides[0].kept, 2);
}

#[test]
fn test_reserved_target_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = MountSetResolver::new(ResolverConfig::new().with_reserved_target("/opt/state"));

    for target in ["/.tempenv", "/.tempenv/x", "/opt/state", "/opt/state/sub"] {
        let err = resolver.resolve(&[rw(dir.path(), target)]).unwrap_err();
        assert!(
            matches!(err.source, SecurityError::ReservedTarget { .. }),
            "{target} gave {:?}",
            err.source
        );
    }
    assert!(resolver.resolve(&[rw(dir.path(), "/opt/other")]).is_ok());
}

#[test]
fn test_mount_strings_parse_and_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("proj");
    fs::create_dir(&project).unwrap();

    let specs: Vec<MountSpec> = [
        format!("{}", project.display()),
        format!("{}:/data:ro", project.display()),
    ]
    .iter()
    .map(|s| s.parse().unwrap())
    .collect();

    let mounts = MountSetResolver::default().resolve(&specs).unwrap();
    assert_eq!(mounts[0].target, PathBuf::from("/workspace/proj"));
    assert_eq!(mounts[0].permission, MountPermission::ReadWrite);
    assert_eq!(mounts[1].target, PathBuf::from("/data"));
    assert!(mounts[1].permission.is_read_only());
}
