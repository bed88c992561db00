use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use dedupfs::{KeySize, KvLog, LogConfig, StoreError};
use tempfile::TempDir;

fn open_default(dir: &TempDir) -> KvLog {
    let _ = env_logger::builder().is_test(true).try_init();
    KvLog::open(LogConfig::new(dir.path().join("store"))).unwrap()
}

#[test]
fn set_then_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);

    let id = log.set(None, b"hello").unwrap();
    assert_eq!(id, 1);
    assert_eq!(log.get(id).unwrap(), b"hello");

    let id2 = log.set(None, b"world").unwrap();
    assert_eq!(id2, 2);
    assert_eq!(log.get(id2).unwrap(), b"world");
}

#[test]
fn history_is_newest_first() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);

    let id = log.set(None, b"Version 1").unwrap();
    assert_eq!(id, 1);
    log.set(Some(1), b"Version 2").unwrap();
    log.set(Some(1), b"Version 3").unwrap();
    log.set(Some(1), b"Version 4").unwrap();

    assert_eq!(log.get(1).unwrap(), b"Version 4");
    let recent = log.get_history(1, 2).unwrap();
    assert_eq!(recent, vec![b"Version 4".to_vec(), b"Version 3".to_vec()]);

    let all = log.get_history(1, 10).unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[3], b"Version 1");
}

#[test]
fn delete_frees_the_slot_for_reuse() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);

    let id = log.set(None, b"doomed").unwrap();
    log.set(Some(id), b"doomed v2").unwrap();
    log.delete(id).unwrap();

    match log.get(id) {
        Err(StoreError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
    match log.delete(id) {
        Err(StoreError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert_eq!(log.get_next_id().unwrap(), id);

    // The reassigned slot starts a fresh history.
    let reused = log.set(None, b"fresh").unwrap();
    assert_eq!(reused, id);
    assert_eq!(log.get_history(id, 10).unwrap(), vec![b"fresh".to_vec()]);
}

#[test]
fn incremental_mode_rejects_unassigned_ids() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);

    match log.set(Some(5), b"x") {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn key_value_mode_requires_ids() {
    let dir = TempDir::new().unwrap();
    let mut config = LogConfig::new(dir.path().join("store"));
    config.incremental_mode = false;
    let log = KvLog::open(config).unwrap();

    match log.set(None, b"x") {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match log.get_next_id() {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }

    // Any id works, including sparse ones.
    log.set(Some(42), b"answer").unwrap();
    assert_eq!(log.get(42).unwrap(), b"answer");
}

#[test]
fn oversized_records_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = LogConfig::new(dir.path().join("store"));
    config.record_size_max = 16;
    config.file_size_max = 4096;
    let log = KvLog::open(config).unwrap();

    log.set(None, &[7u8; 16]).unwrap();
    match log.set(None, &[7u8; 17]) {
        Err(StoreError::SizeExceeded(_)) => {}
        other => panic!("expected SizeExceeded, got {:?}", other),
    }
}

#[test]
fn survives_reopen_after_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");

    {
        let log = KvLog::open(LogConfig::new(&path)).unwrap();
        log.set(None, b"first").unwrap();
        log.set(None, b"second").unwrap();
        log.set(Some(1), b"first v2").unwrap();
        log.close().unwrap();
    }

    let log = KvLog::open(LogConfig::new(&path)).unwrap();
    assert_eq!(log.get(1).unwrap(), b"first v2");
    assert_eq!(log.get(2).unwrap(), b"second");
    assert_eq!(log.get_history(1, 10).unwrap().len(), 2);
    assert_eq!(log.get_next_id().unwrap(), 3);
}

#[test]
fn reset_wipes_existing_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");

    {
        let log = KvLog::open(LogConfig::new(&path)).unwrap();
        log.set(None, b"stale").unwrap();
        log.close().unwrap();
    }

    let mut config = LogConfig::new(&path);
    config.reset = true;
    let log = KvLog::open(config).unwrap();
    assert!(log.is_empty());
    assert!(log.get(1).is_err());
}

#[test]
fn corrupted_payload_fails_with_corrupt() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);

    log.set(None, b"precious bytes").unwrap();

    // Records start after the 4-byte file preamble, and the payload sits
    // after the 12-byte header.
    let data_file = dir.path().join("store").join("0.log");
    let mut file = OpenOptions::new().write(true).open(&data_file).unwrap();
    file.seek(SeekFrom::Start(4 + 12)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    drop(file);

    match log.get(1) {
        Err(StoreError::Corrupt(_)) => {}
        other => panic!("expected Corrupt, got {:?}", other),
    }
}

#[test]
fn corruption_stops_the_history_walk() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);

    log.set(None, b"v1").unwrap();
    log.set(Some(1), b"v2").unwrap();
    log.set(Some(1), b"v3").unwrap();

    // Clobber the oldest record (the first one after the preamble); the
    // newer two must still be reachable.
    let data_file = dir.path().join("store").join("0.log");
    let mut file = OpenOptions::new().write(true).open(&data_file).unwrap();
    file.seek(SeekFrom::Start(4 + 12)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    drop(file);

    let history = log.get_history(1, 10).unwrap();
    assert_eq!(history, vec![b"v3".to_vec(), b"v2".to_vec()]);
}

#[test]
fn rotates_data_files_under_keysize_six() {
    let dir = TempDir::new().unwrap();
    let mut config = LogConfig::new(dir.path().join("store"));
    config.keysize = KeySize::Six;
    config.record_size_max = 64;
    config.file_size_max = 4 + 12 + 64;
    let log = KvLog::open(config).unwrap();

    for i in 0..6u8 {
        log.set(None, &[i; 40]).unwrap();
    }
    for i in 0..6u8 {
        assert_eq!(log.get(i as u32 + 1).unwrap(), vec![i; 40]);
    }
    assert!(dir.path().join("store").join("1.log").exists());

    // History chains work across file boundaries too.
    log.set(Some(1), &[0xEE; 40]).unwrap();
    let history = log.get_history(1, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], vec![0xEE; 40]);
    assert_eq!(history[1], vec![0u8; 40]);
}

#[test]
fn small_keysize_cannot_rotate_past_its_range() {
    let dir = TempDir::new().unwrap();
    let mut config = LogConfig::new(dir.path().join("store"));
    config.keysize = KeySize::Two;
    config.record_size_max = 8 * 1024;
    config.file_size_max = 1024 * 1024;
    let log = KvLog::open(config).unwrap();

    // 2-byte keys address at most 64 KiB of log; writing past that must
    // fail rather than silently wrap.
    let payload = vec![1u8; 8 * 1024];
    let mut result = Ok(0);
    for _ in 0..16 {
        result = log.set(None, &payload);
        if result.is_err() {
            break;
        }
    }
    match result {
        Err(StoreError::SizeExceeded(_)) => {}
        other => panic!("expected SizeExceeded, got {:?}", other),
    }
}

#[test]
fn save_writes_a_snapshot_without_closing() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);

    log.set(None, b"kept").unwrap();
    log.save().unwrap();
    assert!(dir.path().join("store").join("lookup_dump.db").exists());

    // Still usable after save.
    log.set(None, b"more").unwrap();
    assert_eq!(log.get(2).unwrap(), b"more");
}

#[test]
fn destroy_removes_the_directory() {
    let dir = TempDir::new().unwrap();
    let log = open_default(&dir);
    log.set(None, b"gone").unwrap();
    log.destroy().unwrap();
    assert!(!dir.path().join("store").exists());
}
