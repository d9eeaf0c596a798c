//! Engine invariants checked end to end.

use std::io::Read;
use std::path::PathBuf;

use reversion::client::WorkDirCache;
use reversion::datastore::{
    BlobStore, Checksum, ConnectionCache, RepositoryConfig, Version,
};

struct World {
    _dir: tempfile::TempDir,
    root: PathBuf,
    workdirs: WorkDirCache,
    connections: ConnectionCache,
}

fn world(config: RepositoryConfig) -> (World, std::sync::Arc<reversion::client::WorkDirectory>) {
    let dir = tempfile::tempdir().unwrap();
    let world = World {
        root: dir.path().join("w"),
        _dir: dir,
        workdirs: WorkDirCache::new(),
        connections: ConnectionCache::new(),
    };
    let workdir = world
        .workdirs
        .init(&world.root, config, &world.connections)
        .unwrap();
    (world, workdir)
}

fn read_all(version: &Version) -> Vec<u8> {
    let mut bytes = Vec::new();
    version
        .data()
        .unwrap()
        .open()
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    bytes
}

#[test]
fn version_blocks_reconstruct_checksum_and_size() {
    let config = RepositoryConfig {
        block_size: 1024,
        ..Default::default()
    };
    let (w, workdir) = world(config);

    let content: Vec<u8> = (0u32..3000).flat_map(|i| i.to_le_bytes()).collect();
    std::fs::write(w.root.join("multi.bin"), &content).unwrap();
    let snapshot = workdir.commit(&[], false, None, "", false).unwrap().unwrap();

    let version = snapshot.version("multi.bin").unwrap().unwrap();
    // 12000 bytes in 1024 byte blocks -> 12 blocks, dense from 0
    assert_eq!(version.blocks().unwrap().len(), 12);

    let bytes = read_all(&version);
    assert_eq!(bytes.len() as u64, version.size());
    assert_eq!(Checksum::of(&bytes), version.checksum());
}

#[test]
fn stored_blob_files_hash_to_their_record() {
    let config = RepositoryConfig {
        block_size: 512,
        ..Default::default()
    };
    let (w, workdir) = world(config);

    std::fs::write(w.root.join("a.bin"), vec![7u8; 2000]).unwrap();
    std::fs::write(w.root.join("b.bin"), vec![9u8; 700]).unwrap();
    workdir.commit(&[], false, None, "", false).unwrap().unwrap();

    let store = BlobStore::new(w.root.join(".reversion/repository/blobs"));
    let listed = store.list_blobs().unwrap();
    assert!(!listed.is_empty());
    for claimed in listed {
        let blob = store.get_blob(&claimed).unwrap();
        assert_eq!(blob.checksum().unwrap(), claimed);
    }
}

#[test]
fn identical_blocks_within_one_file_are_stored_once() {
    let config = RepositoryConfig {
        block_size: 1024,
        ..Default::default()
    };
    let (w, workdir) = world(config);

    // eight identical blocks collapse into one stored blob
    std::fs::write(w.root.join("x.bin"), vec![b'X'; 8 * 1024]).unwrap();
    workdir.commit(&[], false, None, "", false).unwrap().unwrap();

    let repo = workdir.repository();
    assert_eq!(repo.stored_size().unwrap(), 1024);
    assert_eq!(repo.total_size().unwrap(), 8 * 1024);
}

#[test]
fn empty_file_has_zero_blocks_and_the_empty_hash() {
    let (w, workdir) = world(RepositoryConfig::default());

    std::fs::write(w.root.join("empty"), b"").unwrap();
    let snapshot = workdir.commit(&[], false, None, "", false).unwrap().unwrap();

    let version = snapshot.version("empty").unwrap().unwrap();
    assert_eq!(version.size(), 0);
    assert!(version.blocks().unwrap().is_empty());
    assert_eq!(version.checksum(), Checksum::of(b""));
    assert!(read_all(&version).is_empty());

    // reconstruction of the empty version is still byte faithful
    let target = w.root.join("empty.out");
    version.checkout(&target, false, true).unwrap();
    assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
}

#[test]
fn status_is_empty_after_a_forced_full_commit() {
    let (w, workdir) = world(RepositoryConfig::default());

    std::fs::write(w.root.join("one"), b"1").unwrap();
    std::fs::create_dir_all(w.root.join("deep/deeper")).unwrap();
    std::fs::write(w.root.join("deep/deeper/two"), b"2").unwrap();

    workdir.commit(&[], true, None, "", false).unwrap().unwrap();
    assert!(workdir.status().unwrap().is_empty());
}

#[test]
fn checksum_hex_laws() {
    let checksum = Checksum::of(b"laws");
    assert_eq!(Checksum::from_hex(&checksum.to_hex()).unwrap(), checksum);

    let hex = "ab".repeat(32);
    assert_eq!(Checksum::from_hex(&hex).unwrap().to_hex(), hex);
}
