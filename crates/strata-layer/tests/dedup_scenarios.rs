//! End-to-end deduplication behavior over the chunk store and index.

use std::sync::Arc;
use strata_cas::{digest_bytes, ChunkStore, CHUNK_SIZE};
use strata_index::ChunkIndex;
use strata_layer::stream::{read_stream, write_stream};
use tempfile::TempDir;

fn fixtures(dir: &TempDir) -> (ChunkStore, Arc<ChunkIndex>) {
    let store = ChunkStore::new(dir.path()).unwrap();
    let index = Arc::new(ChunkIndex::open(dir.path().join("index.db")).unwrap());
    (store, index)
}

fn pattern(byte: u8) -> Vec<u8> {
    vec![byte; CHUNK_SIZE]
}

#[test]
fn cross_file_chunk_sharing() {
    let dir = TempDir::new().unwrap();
    let (store, index) = fixtures(&dir);

    let p1 = pattern(0x01);
    let p2 = pattern(0x02);
    let p3 = pattern(0x03);

    // A=[P1,P2], B=[P1,P3], C=[P2,P3]
    let streams = [
        ("a", [&p1, &p2]),
        ("b", [&p1, &p3]),
        ("c", [&p2, &p3]),
    ];
    for (path, parts) in &streams {
        let mut data = Vec::new();
        for part in parts {
            data.extend_from_slice(part);
        }
        write_stream(&store, &index, path, &data[..]).unwrap();
    }

    assert_eq!(store.count().unwrap(), 3);
    assert_eq!(store.total_bytes().unwrap(), 3 * CHUNK_SIZE as u64);
    for part in [&p1, &p2, &p3] {
        assert_eq!(index.refcount(&digest_bytes(part)).unwrap(), 2);
    }
}

#[test]
fn fixed_size_chunking_not_content_defined() {
    let dir = TempDir::new().unwrap();
    let (store, index) = fixtures(&dir);

    // A: 8 MiB of zeros. B: 1 MiB of distinct bytes then 7 MiB of zeros.
    // Fixed windows mean both files' second 4 MiB windows are identical
    // zeros; B's first window differs from A's.
    let file_a = vec![0u8; 2 * CHUNK_SIZE];
    let mut file_b = vec![0xEEu8; CHUNK_SIZE / 4];
    file_b.extend(vec![0u8; 7 * CHUNK_SIZE / 4]);

    write_stream(&store, &index, "a", &file_a[..]).unwrap();
    write_stream(&store, &index, "b", &file_b[..]).unwrap();

    assert_eq!(store.count().unwrap(), 3);
    let zero_window = digest_bytes(&vec![0u8; CHUNK_SIZE]);
    assert_eq!(index.refcount(&zero_window).unwrap(), 3);
}

#[test]
fn dedup_ratio_on_synthetic_workload() {
    let dir = TempDir::new().unwrap();
    let (store, index) = fixtures(&dir);

    // 10 files of one shared window plus one unique window each.
    let shared = pattern(0xAA);
    for i in 0..10u8 {
        let mut data = shared.clone();
        data.extend(pattern(i));
        write_stream(&store, &index, &format!("file-{i}"), &data[..]).unwrap();
    }

    assert_eq!(store.count().unwrap(), 11);
    assert_eq!(store.total_bytes().unwrap(), 11 * CHUNK_SIZE as u64);

    let stats = index.global_stats().unwrap();
    assert_eq!(stats.logical_size, 20 * CHUNK_SIZE as i64);
    assert_eq!(stats.stored_size, 11 * CHUNK_SIZE as i64);
    assert!(stats.dedup_ratio >= 40.0 && stats.dedup_ratio <= 50.0);
}

#[test]
fn concurrent_identical_writes() {
    let dir = TempDir::new().unwrap();
    let (store, index) = fixtures(&dir);
    let content = Arc::new(pattern(0x7F));

    let mut handles = Vec::new();
    for i in 0..5 {
        let store = store.clone();
        let index = Arc::clone(&index);
        let content = Arc::clone(&content);
        handles.push(std::thread::spawn(move || {
            write_stream(&store, &index, &format!("writer-{i}"), &content[..]).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.count().unwrap(), 1);
    let digest = digest_bytes(&content);
    assert_eq!(index.refcount(&digest).unwrap(), 5);
    // The single stored file is intact.
    assert_eq!(store.read_verified(&digest).unwrap().len(), CHUNK_SIZE);
}

#[test]
fn reconstruction_matches_original() {
    let dir = TempDir::new().unwrap();
    let (store, index) = fixtures(&dir);

    let mut data = Vec::new();
    for i in 0..3u8 {
        data.extend(pattern(i * 16));
    }
    data.extend(vec![0x99u8; 12345]);

    write_stream(&store, &index, "stream", &data[..]).unwrap();
    assert_eq!(read_stream(&store, &index, "stream").unwrap(), data);
}

#[test]
fn metadata_independent_of_content() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let (store, index) = fixtures(&dir);

    // Same bytes under two snapshot trees, different modes and mtimes.
    let content = pattern(0x21);
    let tree_a = dir.path().join("snap-a/fs");
    let tree_b = dir.path().join("snap-b/fs");
    for (tree, mode) in [(&tree_a, 0o644), (&tree_b, 0o755)] {
        std::fs::create_dir_all(tree).unwrap();
        let file = tree.join("payload.bin");
        std::fs::write(&file, &content).unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(mode)).unwrap();
        let reader = std::fs::File::open(&file).unwrap();
        write_stream(&store, &index, file.to_str().unwrap(), reader).unwrap();
    }

    // Both references land on one chunk...
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(index.refcount(&digest_bytes(&content)).unwrap(), 2);

    // ...while the filesystem metadata stays distinct.
    let mode_a = std::fs::metadata(tree_a.join("payload.bin")).unwrap().permissions().mode();
    let mode_b = std::fs::metadata(tree_b.join("payload.bin")).unwrap().permissions().mode();
    assert_ne!(mode_a & 0o777, mode_b & 0o777);
    assert_eq!(
        digest_bytes(&std::fs::read(tree_a.join("payload.bin")).unwrap()),
        digest_bytes(&std::fs::read(tree_b.join("payload.bin")).unwrap()),
    );
}

#[test]
fn refcount_zero_allows_physical_deletion() {
    let dir = TempDir::new().unwrap();
    let (store, index) = fixtures(&dir);

    let data = pattern(0x10);
    write_stream(&store, &index, "only", &data[..]).unwrap();
    let digest = digest_bytes(&data);

    // Drop the only reference; the caller erases the chunk file.
    assert_eq!(index.decrement(&digest).unwrap(), 0);
    store.delete(&digest).unwrap();
    assert_eq!(store.count().unwrap(), 0);
}
