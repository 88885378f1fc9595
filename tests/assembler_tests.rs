use async_trait::async_trait;
use bytes::Bytes;
use chunkferry::assembler::{AssemblyError, ChunkAssembler};
use chunkferry::registry::{SessionRegistry, SESSION_ID_BYTES};
use chunkferry::storage::{DiskStorage, StorageSink, StoredFile};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn disk_assembler(dir: &tempfile::TempDir) -> ChunkAssembler {
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    let storage = Arc::new(DiskStorage::new(dir.path().to_path_buf()));
    ChunkAssembler::new(registry, storage)
}

// storage that counts writes and keeps nothing
#[derive(Default)]
struct CountingStorage {
    writes: AtomicUsize,
}

#[async_trait]
impl StorageSink for CountingStorage {
    async fn persist(&self, filename: &str, content: Bytes) -> std::io::Result<StoredFile> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(StoredFile {
            path: PathBuf::from(filename),
            size: content.len() as u64,
            sha256: String::new(),
        })
    }
}

struct BrokenStorage;

#[async_trait]
impl StorageSink for BrokenStorage {
    async fn persist(&self, _filename: &str, _content: Bytes) -> std::io::Result<StoredFile> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }
}

#[tokio::test]
async fn test_session_ids_are_random_hex() {
    let registry = SessionRegistry::new(Duration::from_secs(60));

    let a = registry.create_session("a.bin".into(), 10, 1).unwrap();
    let b = registry.create_session("a.bin".into(), 10, 1).unwrap();

    assert_eq!(a.len(), SESSION_ID_BYTES * 2);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
    assert_eq!(registry.len(), 2);

    assert!(registry.get_session(&a).is_some());
    assert!(registry.get_session("nope").is_none());
}

#[tokio::test]
async fn test_out_of_order_chunks_assemble_in_index_order() {
    let temp_dir = tempfile::tempdir().unwrap();
    let assembler = disk_assembler(&temp_dir);

    let id = assembler.open("abc.txt".into(), 9, 3).await.unwrap();

    // chunk 2 arrives first
    let r2 = assembler.accept_chunk(&id, 2, Bytes::from_static(b"ccc"), 3).await.unwrap();
    assert_eq!(r2.size, 3);
    assert!(r2.completed.is_none());

    let r0 = assembler.accept_chunk(&id, 0, Bytes::from_static(b"aaa"), 3).await.unwrap();
    assert!(r0.completed.is_none());

    let r1 = assembler.accept_chunk(&id, 1, Bytes::from_static(b"bbb"), 3).await.unwrap();
    let stored = r1.completed.expect("last chunk completes the upload");
    assert_eq!(stored.size, 9);
    assert_eq!(stored.sha256.len(), 64);

    let content = std::fs::read(temp_dir.path().join("abc.txt")).unwrap();
    assert_eq!(content, b"aaabbbccc");

    // session is gone once the file is written
    assert!(assembler.registry().get_session(&id).is_none());
    let late = assembler.accept_chunk(&id, 0, Bytes::from_static(b"aaa"), 3).await;
    assert!(matches!(late, Err(AssemblyError::UnknownSession)));
}

#[tokio::test]
async fn test_truncated_chunk_is_not_committed() {
    let temp_dir = tempfile::tempdir().unwrap();
    let assembler = disk_assembler(&temp_dir);

    let id = assembler.open("t.bin".into(), 8, 2).await.unwrap();

    let err = assembler
        .accept_chunk(&id, 0, Bytes::from_static(b"ab"), 4)
        .await
        .unwrap_err();
    assert!(matches!(err, AssemblyError::IncompleteChunk { declared: 4, received: 2 }));
    assert_eq!(err.to_string(), "Chunk uploading was not completed");

    let handle = assembler.registry().get_session(&id).unwrap();
    assert_eq!(handle.lock().await.received(), 0);
    assert_eq!(handle.lock().await.chunk_len(0), None);

    // the same index can be retried
    let ok = assembler.accept_chunk(&id, 0, Bytes::from_static(b"abcd"), 4).await.unwrap();
    assert_eq!(ok.size, 4);
    assert_eq!(handle.lock().await.received(), 1);
}

#[tokio::test]
async fn test_duplicate_chunk_is_idempotent() {
    let temp_dir = tempfile::tempdir().unwrap();
    let assembler = disk_assembler(&temp_dir);

    let id = assembler.open("dup.bin".into(), 6, 2).await.unwrap();

    assembler.accept_chunk(&id, 0, Bytes::from_static(b"one"), 3).await.unwrap();
    let again = assembler.accept_chunk(&id, 0, Bytes::from_static(b"xyz"), 3).await.unwrap();
    assert_eq!(again.size, 3);
    assert!(again.completed.is_none());

    let handle = assembler.registry().get_session(&id).unwrap();
    assert_eq!(handle.lock().await.received(), 1);

    let done = assembler.accept_chunk(&id, 1, Bytes::from_static(b"two"), 3).await.unwrap();
    assert!(done.completed.is_some());

    // first accepted bytes win
    let content = std::fs::read(temp_dir.path().join("dup.bin")).unwrap();
    assert_eq!(content, b"onetwo");
}

#[tokio::test]
async fn test_chunk_index_out_of_range() {
    let temp_dir = tempfile::tempdir().unwrap();
    let assembler = disk_assembler(&temp_dir);

    let id = assembler.open("r.bin".into(), 4, 2).await.unwrap();
    let err = assembler
        .accept_chunk(&id, 2, Bytes::from_static(b"ab"), 2)
        .await
        .unwrap_err();

    assert!(matches!(err, AssemblyError::ChunkOutOfRange { index: 2, chunk_count: 2 }));
}

#[tokio::test]
async fn test_unknown_session() {
    let temp_dir = tempfile::tempdir().unwrap();
    let assembler = disk_assembler(&temp_dir);

    let err = assembler
        .accept_chunk("missing", 0, Bytes::from_static(b"ab"), 2)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Wrong content id header");
}

#[tokio::test]
async fn test_empty_upload_is_stored_on_open() {
    let temp_dir = tempfile::tempdir().unwrap();
    let assembler = disk_assembler(&temp_dir);

    let id = assembler.open("empty.txt".into(), 0, 0).await.unwrap();

    assert!(assembler.registry().get_session(&id).is_none());
    let content = std::fs::read(temp_dir.path().join("empty.txt")).unwrap();
    assert!(content.is_empty());
}

#[tokio::test]
async fn test_declared_size_mismatch_discards_session() {
    let temp_dir = tempfile::tempdir().unwrap();
    let assembler = disk_assembler(&temp_dir);

    let id = assembler.open("short.bin".into(), 100, 1).await.unwrap();
    let err = assembler
        .accept_chunk(&id, 0, Bytes::from_static(b"abc"), 3)
        .await
        .unwrap_err();

    assert!(matches!(err, AssemblyError::SizeMismatch { declared: 100, assembled: 3 }));
    assert!(assembler.registry().get_session(&id).is_none());
    assert!(!temp_dir.path().join("short.bin").exists());
}

#[tokio::test]
async fn test_storage_failure_discards_session() {
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    let assembler = ChunkAssembler::new(registry.clone(), Arc::new(BrokenStorage));

    let id = assembler.open("lost.bin".into(), 2, 1).await.unwrap();
    let err = assembler
        .accept_chunk(&id, 0, Bytes::from_static(b"ab"), 2)
        .await
        .unwrap_err();

    assert!(matches!(err, AssemblyError::Storage(_)));
    assert_eq!(err.to_string(), "Failed to persist uploaded file");
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_concurrent_final_chunks_assemble_once() {
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    let storage = Arc::new(CountingStorage::default());
    let assembler = ChunkAssembler::new(registry.clone(), storage.clone());

    let chunks = 32usize;
    let id = assembler.open("race.bin".into(), chunks as u64, chunks).await.unwrap();

    let mut tasks = Vec::new();
    for index in 0..chunks {
        let assembler = assembler.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            assembler
                .accept_chunk(&id, index, Bytes::from(vec![index as u8]), 1)
                .await
        }));
    }

    let mut completions = 0;
    for task in tasks {
        let receipt = task.await.unwrap().unwrap();
        if receipt.completed.is_some() {
            completions += 1;
        }
    }

    assert_eq!(completions, 1);
    assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_purge_expired_sessions() {
    let registry = Arc::new(SessionRegistry::new(Duration::from_millis(20)));

    let stale = registry.create_session("stale.bin".into(), 1, 1).unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let fresh = registry.create_session("fresh.bin".into(), 1, 1).unwrap();

    assert_eq!(registry.purge_expired(), 1);
    assert!(registry.get_session(&stale).is_none());
    assert!(registry.get_session(&fresh).is_some());
}

#[tokio::test]
async fn test_expiry_task_sweeps_in_background() {
    let registry = Arc::new(SessionRegistry::new(Duration::from_millis(10)));
    let id = registry.create_session("idle.bin".into(), 1, 1).unwrap();

    let sweeper = registry.spawn_expiry_task(Duration::from_millis(15));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(registry.get_session(&id).is_none());
    sweeper.abort();
}
