//! Integration tests for the temporary file registry.
//!
//! These tests verify:
//! - Created paths are private and tracked until swept
//! - Sweeping is idempotent
//! - Creation and sweeping can race without losing or half-deleting entries
//! - Leftovers of dead processes are swept, those of live ones are kept

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Barrier};
use std::thread;

use tempenv::tempfiles::{TEMP_PREFIX, TempFileRegistry, TempKind};

/// A pid above the kernel's maximum, so never alive.
const DEAD_PID: u32 = 4_194_305;

// =============================================================================
// Creation Tests
// =============================================================================

#[test]
fn test_created_paths_are_private_and_tracked() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());

    let file = registry.create_temp_file("scratch").unwrap();
    let subdir = registry.create_temp_dir("unpack").unwrap();

    assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o600);
    assert_eq!(fs::metadata(&subdir).unwrap().permissions().mode() & 0o777, 0o700);
    assert!(registry.is_tracked(&file));
    assert!(registry.is_tracked(&subdir));

    let name = file.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with(&format!("{TEMP_PREFIX}{}-scratch-", std::process::id())));

    let kinds: Vec<_> = registry.tracked().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&TempKind::File));
    assert!(kinds.contains(&TempKind::Directory));
}

#[test]
fn test_template_is_sanitised() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());

    let file = registry.create_temp_file("../evil name").unwrap();
    assert_eq!(file.parent().unwrap(), dir.path());
    let name = file.file_name().unwrap().to_str().unwrap();
    assert!(!name.contains('/'));
    assert!(!name.contains(' '));
}

#[test]
fn test_untrack_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());

    let file = registry.create_temp_file("keep").unwrap();
    assert!(registry.untrack(&file).is_some());
    assert!(registry.untrack(&file).is_none());

    registry.sweep().unwrap();
    assert!(file.exists());
}

// =============================================================================
// Sweep Tests
// =============================================================================

#[test]
fn test_sweep_removes_everything_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());

    let file = registry.create_temp_file("a").unwrap();
    let subdir = registry.create_temp_dir("b").unwrap();
    fs::write(subdir.join("inner.txt"), b"data").unwrap();

    let first = registry.sweep().unwrap();
    assert_eq!(first.removed.len(), 2);
    assert!(!file.exists());
    assert!(!subdir.exists());
    assert!(registry.tracked().is_empty());

    let second = registry.sweep().unwrap();
    assert!(second.is_empty());
}

#[test]
fn test_sweep_tolerates_already_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());

    let file = registry.create_temp_file("gone").unwrap();
    fs::remove_file(&file).unwrap();

    let report = registry.sweep().unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.already_missing, vec![file]);
}

#[test]
fn test_concurrent_create_and_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(TempFileRegistry::with_dir(dir.path()));
    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers + 1));

    let creators: Vec<_> = (0..workers)
        .map(|i| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..25)
                    .map(|_| registry.create_temp_file(&format!("w{i}")).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let sweeper = {
        let registry = Arc::clone(&registry);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..10 {
                registry.sweep().unwrap();
                thread::yield_now();
            }
        })
    };

    let created: Vec<_> = creators
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    sweeper.join().unwrap();

    // Every path is either still tracked and present, or swept and gone.
    for path in &created {
        assert_eq!(registry.is_tracked(path), path.exists(), "{}", path.display());
    }

    registry.sweep().unwrap();
    assert!(created.iter().all(|p| !p.exists()));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

// =============================================================================
// Stale Sweep Tests
// =============================================================================

#[test]
fn test_sweep_stale_removes_dead_process_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());

    let stale_file = dir.path().join(format!("{TEMP_PREFIX}{DEAD_PID}-record-abc.tmp"));
    let stale_dir = dir.path().join(format!("{TEMP_PREFIX}{DEAD_PID}-unpack-def"));
    fs::write(&stale_file, b"partial").unwrap();
    fs::create_dir(&stale_dir).unwrap();
    fs::write(stale_dir.join("x"), b"x").unwrap();

    let mut removed = registry.sweep_stale(dir.path()).unwrap();
    removed.sort();
    let mut expected = vec![stale_file.clone(), stale_dir.clone()];
    expected.sort();
    assert_eq!(removed, expected);
    assert!(!stale_file.exists());
    assert!(!stale_dir.exists());
}

#[test]
fn test_sweep_stale_keeps_live_and_unrelated_files() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());

    let own = registry.create_temp_file("mine").unwrap();
    let unrelated = dir.path().join("notes.txt");
    let odd = dir.path().join(format!("{TEMP_PREFIX}notapid-x"));
    fs::write(&unrelated, b"keep").unwrap();
    fs::write(&odd, b"keep").unwrap();

    let removed = registry.sweep_stale(dir.path()).unwrap();
    assert!(removed.is_empty());
    assert!(own.exists());
    assert!(unrelated.exists());
    assert!(odd.exists());
}

#[test]
fn test_sweep_stale_twice_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TempFileRegistry::with_dir(dir.path());
    fs::write(dir.path().join(format!("{TEMP_PREFIX}{DEAD_PID}-x-1.tmp")), b"").unwrap();

    assert_eq!(registry.sweep_stale(dir.path()).unwrap().len(), 1);
    assert!(registry.sweep_stale(dir.path()).unwrap().is_empty());
}
