//! Mount smoke test. Runs only where a fuse device is usable; everything
//! else about the exposed tree is covered by the unit tests.

use std::path::Path;

use rvn_datastore::{ConnectionCache, Repository, RepositoryConfig};
use rvn_fuse::SnapshotMounter;

#[test]
fn mounted_snapshot_serves_recorded_bytes() {
    if !Path::new("/dev/fuse").exists() {
        eprintln!("skipping mount test - no fuse device");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("work");
    std::fs::create_dir_all(workdir.join("sub")).unwrap();
    std::fs::write(workdir.join("hello.txt"), b"hello mount").unwrap();
    std::fs::write(workdir.join("sub/nested.txt"), b"nested").unwrap();

    let cache = ConnectionCache::new();
    let repo = Repository::create(
        &dir.path().join("repo"),
        RepositoryConfig::default(),
        &cache,
    )
    .unwrap();
    let timeline = repo.create_timeline().unwrap();
    let snapshot = timeline
        .create_snapshot(
            &["hello.txt".to_string(), "sub/nested.txt".to_string()],
            &workdir,
            None,
            "",
            false,
        )
        .unwrap();

    let mounter = SnapshotMounter::new();
    let mount_point = dir.path().join("mnt");
    if let Err(err) = mounter.mount(&snapshot, &mount_point) {
        // environments without fusermount cannot run this test
        eprintln!("skipping mount test - {}", err);
        return;
    }
    assert!(mounter.is_mounted(&mount_point));

    // mounting twice is a no-op
    mounter.mount(&snapshot, &mount_point).unwrap();

    let served = std::fs::read(mount_point.join("hello.txt")).unwrap();
    assert_eq!(served, b"hello mount");
    let served = std::fs::read(mount_point.join("sub/nested.txt")).unwrap();
    assert_eq!(served, b"nested");

    let listed: Vec<String> = std::fs::read_dir(&mount_point)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(listed.len(), 2);

    // read-only: writes must fail
    assert!(std::fs::write(mount_point.join("new.txt"), b"nope").is_err());

    assert!(mounter.unmount(&mount_point).unwrap());
    assert!(!mounter.is_mounted(&mount_point));
}
