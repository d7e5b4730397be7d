//! End-to-end patching against a real patch directory.
//!
//! A release is published into an in-memory "server", mirrored by a
//! [`MemoryTransport`], and patched into an [`FsStorage`] rooted in a temp
//! directory. Successive releases exercise incremental patching, removal,
//! interruption, and restart.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use patchwork_runtime::prelude::*;

const BASE: &str = "mem://cdn/patch";

fn config(root: &Path) -> PatchConfig {
    PatchConfig {
        patch_root: root.to_path_buf(),
        remote_base_url: BASE.to_owned(),
        retry_delay_ticks: 1,
        ..Default::default()
    }
}

/// Publish `sources` as `version` on a fresh server and serve it.
fn release(transport: &MemoryTransport, version: u32, sources: &[BundleSource]) -> PatchManifest {
    let mut server = MemoryStorage::new();
    let manifest = publish(&mut server, &PatchConfig::default(), version, sources).unwrap();
    transport.mirror(BASE, &server);
    manifest
}

fn client(root: &Path, transport: &MemoryTransport) -> PatchSystem {
    PatchSystem::builder(config(root))
        .storage(FsStorage::create(root).unwrap())
        .transport(transport.clone())
        .sink(CollectingSink::new())
        .build()
        .unwrap()
}

fn check(system: &mut PatchSystem) -> PatchPlan {
    let handle = system.check_patch();
    system.run_until_idle(1_000);
    handle.result().unwrap().unwrap()
}

fn first_release() -> Vec<BundleSource> {
    vec![
        BundleSource::new("ui_common", b"common v1".to_vec()),
        BundleSource::new("ui_login", b"login v1".to_vec()).with_dependencies(["ui_common"]),
        BundleSource::new("legacy_intro", b"intro".to_vec()),
    ]
}

fn second_release() -> Vec<BundleSource> {
    vec![
        BundleSource::new("ui_common", b"common v2".to_vec()),
        BundleSource::new("ui_login", b"login v1".to_vec()).with_dependencies(["ui_common"]),
    ]
}

// ---------------------------------------------------------------------------
// Fresh install
// ---------------------------------------------------------------------------

#[test]
fn fresh_install_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let remote = release(&transport, 1, &first_release());
    let mut system = client(dir.path(), &transport);
    assert_eq!(system.current_manifest_version(), None);

    let plan = check(&mut system);
    assert_eq!(plan.local_version, None);
    assert_eq!(plan.downloads.len(), 3);
    assert_eq!(plan.download_bytes, remote.total_size());

    let progress = Rc::new(RefCell::new(Vec::new()));
    let seen = progress.clone();
    let patch = system.patch_with_progress(plan, move |entry| {
        seen.borrow_mut().push(entry.file_name.clone());
    });
    let asset = system.load_asset("ui_login", "UI_Login");
    system.run_until_idle(1_000);

    let summary = patch.output().unwrap();
    assert_eq!(summary.version, 1);
    assert_eq!(*progress.borrow(), vec!["legacy_intro", "ui_common", "ui_login"]);
    assert_eq!(summary.files_written, *progress.borrow());
    assert_eq!(system.current_manifest_version(), Some(1));

    let cfg = config(dir.path());
    for name in ["ui_common", "ui_login", "legacy_intro"] {
        assert!(dir.path().join(cfg.bundle_path(name)).is_file(), "{name} file");
        assert!(dir.path().join(cfg.manifest_path(name)).is_file(), "{name} sidecar");
    }
    assert!(dir.path().join(&cfg.aggregate_manifest_name).is_file());

    let object = asset.output().unwrap();
    assert_eq!(object.downcast_ref::<Vec<u8>>().unwrap().as_slice(), b"login v1");
}

// ---------------------------------------------------------------------------
// Incremental patch
// ---------------------------------------------------------------------------

#[test]
fn incremental_patch_downloads_changes_and_removes_dropped_bundles() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let transport = MemoryTransport::new();
    release(&transport, 1, &first_release());
    let mut system = client(dir.path(), &transport);
    let plan = check(&mut system);
    system.patch(plan);
    system.run_until_idle(1_000);

    release(&transport, 2, &second_release());
    let plan = check(&mut system);
    assert_eq!(plan.local_version, Some(1));
    assert_eq!(
        plan.downloads.iter().map(|e| e.file_name.as_str()).collect::<Vec<_>>(),
        vec!["ui_common"]
    );
    assert_eq!(plan.removals, vec!["legacy_intro"]);

    let patch = system.patch(plan);
    system.run_until_idle(1_000);
    let summary = patch.output().unwrap();
    assert_eq!(summary.version, 2);
    assert_eq!(summary.removed, vec!["legacy_intro"]);

    assert!(!dir.path().join(cfg.bundle_path("legacy_intro")).exists());
    assert!(!dir.path().join(cfg.manifest_path("legacy_intro")).exists());
    let common = std::fs::read(dir.path().join(cfg.bundle_path("ui_common"))).unwrap();
    assert_eq!(common, b"common v2");
}

#[test]
fn restart_sees_installed_release() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    release(&transport, 4, &second_release());
    {
        let mut system = client(dir.path(), &transport);
        let plan = check(&mut system);
        system.patch(plan);
        system.run_until_idle(1_000);
    }

    let mut restarted = client(dir.path(), &transport);
    assert_eq!(restarted.current_manifest_version(), Some(4));
    let plan = check(&mut restarted);
    assert!(plan.is_up_to_date());
    assert_eq!(plan.download_bytes, 0);
}

// ---------------------------------------------------------------------------
// Interruption
// ---------------------------------------------------------------------------

#[test]
fn failed_patch_keeps_previous_release_and_replans() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let transport = MemoryTransport::new();
    release(&transport, 1, &first_release());
    let mut system = client(dir.path(), &transport);
    let plan = check(&mut system);
    system.patch(plan);
    system.run_until_idle(1_000);

    release(&transport, 2, &second_release());
    let common_url = cfg.remote_url(&cfg.bundle_path("ui_common"));
    transport.fail_next(common_url.clone(), cfg.download_retries + 1);

    let plan = check(&mut system);
    let patch = system.patch(plan).without_errors();
    system.run_until_idle(1_000);

    assert!(matches!(
        patch.error(),
        Some(PatchError::Download { ref url, attempts: 3, .. }) if *url == common_url
    ));
    assert_eq!(system.current_manifest_version(), Some(1));
    assert!(dir.path().join(cfg.bundle_path("legacy_intro")).is_file());

    let replanned = check(&mut system);
    assert_eq!(replanned.local_version, Some(1));
    assert_eq!(replanned.downloads.len(), 1);
    let retry = system.patch(replanned);
    system.run_until_idle(1_000);
    assert_eq!(retry.output().unwrap().version, 2);
}

#[test]
fn deleted_local_file_is_downloaded_again() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let transport = MemoryTransport::new();
    release(&transport, 1, &second_release());
    let mut system = client(dir.path(), &transport);
    let plan = check(&mut system);
    system.patch(plan);
    system.run_until_idle(1_000);

    std::fs::remove_file(dir.path().join(cfg.bundle_path("ui_login"))).unwrap();
    let plan = check(&mut system);
    assert_eq!(plan.local_version, Some(1));
    assert_eq!(plan.downloads.len(), 1);
    assert_eq!(plan.downloads[0].file_name, "ui_login");
}
