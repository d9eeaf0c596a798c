//! Full stack round trips through the facade crate.

use std::io::Read;
use std::path::PathBuf;

use reversion::client::WorkDirCache;
use reversion::datastore::{verify, Checksum, CleanupPolicy, ConnectionCache, RepositoryConfig};
use reversion::tools::task::ForegroundTask;

struct World {
    _dir: tempfile::TempDir,
    root: PathBuf,
    workdirs: WorkDirCache,
    connections: ConnectionCache,
}

fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    World {
        root: dir.path().join("w"),
        _dir: dir,
        workdirs: WorkDirCache::new(),
        connections: ConnectionCache::new(),
    }
}

#[test]
fn create_commit_list() {
    let w = world();
    let workdir = w
        .workdirs
        .init(&w.root, RepositoryConfig::default(), &w.connections)
        .unwrap();

    std::fs::write(w.root.join("a.txt"), b"hello").unwrap();
    let snapshot = workdir
        .commit(&[w.root.join("a.txt")], false, None, "", false)
        .unwrap()
        .unwrap();

    assert_eq!(snapshot.revision(), 1);
    let version = snapshot.version("a.txt").unwrap().unwrap();
    assert_eq!(version.checksum(), Checksum::of(b"hello"));
    assert!(workdir.status().unwrap().is_empty());
}

#[test]
fn dedup_across_identical_commits() {
    let w = world();
    let workdir = w
        .workdirs
        .init(&w.root, RepositoryConfig::default(), &w.connections)
        .unwrap();

    let content = vec![b'X'; 8192];
    std::fs::write(w.root.join("a.txt"), &content).unwrap();
    workdir.commit(&[], false, None, "", false).unwrap().unwrap();
    std::fs::write(w.root.join("a.txt"), &content).unwrap();
    workdir.commit(&[], true, None, "", false).unwrap().unwrap();

    let repo = workdir.repository();
    assert_eq!(
        workdir.timeline().unwrap().list_versions("a.txt").unwrap().len(),
        2
    );
    assert_eq!(repo.stored_size().unwrap(), 8192);
    assert_eq!(repo.total_size().unwrap(), 2 * 8192);
}

#[test]
fn commit_update_round_trip_restores_bytes_and_metadata() {
    let w = world();
    let workdir = w
        .workdirs
        .init(&w.root, RepositoryConfig::default(), &w.connections)
        .unwrap();

    let path = w.root.join("data.bin");
    let content: Vec<u8> = (0u32..4096).flat_map(|i| i.to_le_bytes()).collect();
    std::fs::write(&path, &content).unwrap();
    reversion::tools::fs::set_file_mtime(&path, 1_555_000_000_000).unwrap();

    workdir.commit(&[], false, None, "", false).unwrap().unwrap();

    // clobber and bring it back
    std::fs::write(&path, b"clobbered").unwrap();
    workdir
        .update(&[path.clone()], Some(1), true, &ForegroundTask)
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), content);
    assert_eq!(
        reversion::tools::fs::file_mtime(&path).unwrap(),
        1_555_000_000_000
    );
}

#[test]
fn mounted_view_matches_cumulative_versions() {
    // the mount itself needs a fuse device, but the filesystem image the
    // mount serves must already match the snapshot's cumulative data
    let w = world();
    let workdir = w
        .workdirs
        .init(&w.root, RepositoryConfig::default(), &w.connections)
        .unwrap();

    std::fs::create_dir_all(w.root.join("sub")).unwrap();
    std::fs::write(w.root.join("top.txt"), b"top").unwrap();
    std::fs::write(w.root.join("sub/inner.txt"), b"inner").unwrap();
    let snapshot = workdir.commit(&[], false, None, "", false).unwrap().unwrap();

    for (path, version) in snapshot.cumulative_versions().unwrap() {
        let mut bytes = Vec::new();
        version
            .data()
            .unwrap()
            .open()
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, std::fs::read(w.root.join(&path)).unwrap());
    }
}

#[test]
fn verify_and_repair_through_the_facade() {
    let w = world();
    let workdir = w
        .workdirs
        .init(&w.root, RepositoryConfig::default(), &w.connections)
        .unwrap();

    std::fs::write(w.root.join("a.txt"), b"hello").unwrap();
    workdir.commit(&[], false, None, "", false).unwrap().unwrap();

    // corrupt the stored blob, keep the working copy
    let checksum = Checksum::of(b"hello");
    let blob_path = w
        .root
        .join(".reversion/repository/blobs")
        .join(checksum.hex_prefix())
        .join(checksum.to_hex());
    std::fs::write(&blob_path, b"HELLO").unwrap();

    let repo_path = w.root.join(".reversion/repository");
    let actions = verify::verify(&repo_path, &w.connections, &ForegroundTask).unwrap();
    assert_eq!(actions.len(), 1);

    let report = actions[0].repair(&w.root, &w.connections, &ForegroundTask).unwrap();
    assert_eq!(report.repaired_versions, vec!["a.txt".to_string()]);
    assert!(verify::verify(&repo_path, &w.connections, &ForegroundTask).unwrap().is_empty());
}

#[test]
fn cleanup_policy_applies_through_the_facade() {
    let w = world();
    let workdir = w
        .workdirs
        .init(&w.root, RepositoryConfig::default(), &w.connections)
        .unwrap();

    for generation in 0..5 {
        std::fs::write(w.root.join("p.txt"), format!("gen {}", generation)).unwrap();
        workdir.commit(&[], false, None, "", false).unwrap().unwrap();
    }

    let timeline = workdir.timeline().unwrap();
    timeline
        .set_cleanup_policies(&[CleanupPolicy::of_versions(2)])
        .unwrap();
    let removed = timeline.clean_up(&ForegroundTask).unwrap();

    assert_eq!(removed, 3);
    assert_eq!(timeline.list_versions("p.txt").unwrap().len(), 2);

    // clean is idempotent: a second pass removes nothing
    assert_eq!(workdir.repository().clean().unwrap().removed_blobs, 0);
}
