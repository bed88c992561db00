use std::io::SeekFrom;

use dedupfs::{LocalVfs, LogVfs, NestedVfs, OpenMode, StoreError, Vfs};
use tempfile::TempDir;

fn open_fs(dir: &TempDir) -> LogVfs {
    LogVfs::open(dir.path().join("fs"), false).unwrap()
}

#[test]
fn create_read_list_delete() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.dir_create("/a").unwrap();
    fs.dir_create("/a/b").unwrap();
    fs.file_create("/a/f.txt").unwrap();
    fs.file_write("/a/f.txt", b"hello").unwrap();
    assert_eq!(fs.file_read("/a/f.txt").unwrap(), b"hello");

    let mut names: Vec<String> = fs
        .dir_list("/a")
        .unwrap()
        .iter()
        .map(|entry| entry.name().to_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["b".to_owned(), "f.txt".to_owned()]);

    fs.dir_delete("/a").unwrap();
    assert!(!fs.exists("/a"));
    assert!(!fs.exists("/a/b"));
    assert!(!fs.exists("/a/f.txt"));
}

#[test]
fn copy_then_rename() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.file_create("/src.txt").unwrap();
    fs.file_write("/src.txt", b"X").unwrap();

    fs.copy("/src.txt", "/dst.txt").unwrap();
    assert_eq!(fs.file_read("/dst.txt").unwrap(), b"X");
    assert!(fs.exists("/src.txt"));

    fs.rename("/src.txt", "/moved.txt").unwrap();
    assert!(!fs.exists("/src.txt"));
    assert_eq!(fs.file_read("/moved.txt").unwrap(), b"X");
}

#[test]
fn paths_and_entries_are_dual() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.dir_create("/a/b").unwrap();
    fs.file_create("/a/b/c.txt").unwrap();
    fs.file_write("/a/b/c.txt", b"payload").unwrap();
    fs.link_create("/a/b/c.txt", "/a/ln").unwrap();

    for path in &["/", "/a", "/a/b", "/a/b/c.txt", "/a/ln"] {
        let entry = fs.get(path).unwrap();
        assert_eq!(&fs.get_path(&entry).unwrap(), path);
        assert_eq!(fs.get(&fs.get_path(&entry).unwrap()).unwrap(), entry);
    }
}

#[test]
fn deep_copy_allocates_fresh_ids() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.dir_create("/tree/sub").unwrap();
    fs.file_create("/tree/sub/f").unwrap();
    fs.file_write("/tree/sub/f", b"deep").unwrap();
    fs.link_create("/tree/sub/f", "/tree/ln").unwrap();

    let copied = fs.copy("/tree", "/copy").unwrap();
    assert_ne!(copied.id(), fs.get("/tree").unwrap().id());
    assert_eq!(fs.file_read("/copy/sub/f").unwrap(), b"deep");
    assert_eq!(fs.link_read("/copy/ln").unwrap(), "/tree/sub/f");

    // The copy is independent of the original.
    fs.file_write("/tree/sub/f", b"changed").unwrap();
    assert_eq!(fs.file_read("/copy/sub/f").unwrap(), b"deep");

    fs.dir_delete("/tree").unwrap();
    assert_eq!(fs.file_read("/copy/sub/f").unwrap(), b"deep");
}

#[test]
fn concatenate_appends_and_tracks_size() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.file_create("/f").unwrap();
    fs.file_write("/f", b"foo").unwrap();
    fs.file_concatenate("/f", b"bar").unwrap();
    assert_eq!(fs.file_read("/f").unwrap(), b"foobar");
    assert_eq!(fs.get("/f").unwrap().metadata().size, 6);
}

#[test]
fn large_files_span_many_chunks() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    fs.file_create("/big").unwrap();
    fs.file_write("/big", &payload).unwrap();
    assert_eq!(fs.file_read("/big").unwrap(), payload);
    assert_eq!(fs.get("/big").unwrap().metadata().size, 100_000);

    // Replacing with something smaller shrinks the file.
    fs.file_write("/big", b"tiny").unwrap();
    assert_eq!(fs.file_read("/big").unwrap(), b"tiny");
    assert_eq!(fs.get("/big").unwrap().metadata().size, 4);
}

#[test]
fn symlinks_store_their_target_verbatim() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.file_create("/target").unwrap();
    let link = fs.link_create("/target", "/ln").unwrap();
    assert!(link.is_symlink());
    assert_eq!(fs.link_read("/ln").unwrap(), "/target");
    assert_eq!(fs.get("/ln").unwrap().metadata().size, "/target".len() as u64);

    match fs.link_read("/target") {
        Err(StoreError::NotSymlink(_)) => {}
        other => panic!("expected NotSymlink, got {:?}", other),
    }

    fs.link_delete("/ln").unwrap();
    assert!(!fs.exists("/ln"));
    assert!(fs.exists("/target"));
}

#[test]
fn malformed_paths_are_invalid_arguments() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    for bad in &["relative", "/a/../b", "/a/./b", "/a//b", ""] {
        match fs.get(bad) {
            Err(StoreError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument for {:?}, got {:?}", bad, other),
        }
        assert!(!fs.exists(bad));
    }
}

#[test]
fn create_collisions_and_missing_parents() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.file_create("/f").unwrap();
    match fs.file_create("/f") {
        Err(StoreError::AlreadyExists(_)) => {}
        other => panic!("expected AlreadyExists, got {:?}", other),
    }

    // dir_create is idempotent.
    fs.dir_create("/d").unwrap();
    let again = fs.dir_create("/d").unwrap();
    assert!(again.is_dir());

    match fs.file_create("/missing/f") {
        Err(StoreError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
    match fs.dir_create("/f/sub") {
        Err(StoreError::NotDirectory(_)) => {}
        other => panic!("expected NotDirectory, got {:?}", other),
    }
}

#[test]
fn rename_collisions_and_missing_destinations() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.file_create("/a").unwrap();
    fs.file_create("/b").unwrap();

    match fs.rename("/a", "/b") {
        Err(StoreError::AlreadyExists(_)) => {}
        other => panic!("expected AlreadyExists, got {:?}", other),
    }
    match fs.rename("/a", "/nope/a") {
        Err(StoreError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }

    fs.dir_create("/d").unwrap();
    match fs.rename("/d", "/d/inner") {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn rename_keeps_the_entry_id() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.dir_create("/from").unwrap();
    fs.dir_create("/to").unwrap();
    fs.file_create("/from/f").unwrap();
    fs.file_write("/from/f", b"kept").unwrap();
    let before = fs.get("/from/f").unwrap();

    let moved = fs.move_entry("/from/f", "/to/g").unwrap();
    assert_eq!(moved.id(), before.id());
    assert_eq!(moved.name(), "g");
    assert_eq!(fs.file_read("/to/g").unwrap(), b"kept");
    assert!(!fs.exists("/from/f"));
    assert!(fs.dir_list("/from").unwrap().is_empty());
}

#[test]
fn delete_dispatches_on_kind() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.dir_create("/d/sub").unwrap();
    fs.file_create("/f").unwrap();
    fs.link_create("/f", "/ln").unwrap();

    fs.delete("/d").unwrap();
    fs.delete("/f").unwrap();
    fs.delete("/ln").unwrap();
    assert!(fs.dir_list("/").unwrap().is_empty());

    match fs.delete("/") {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn survives_reopen_after_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fs");

    {
        let fs = LogVfs::open(&path, false).unwrap();
        fs.dir_create("/kept").unwrap();
        fs.file_create("/kept/f").unwrap();
        fs.file_write("/kept/f", b"durable").unwrap();
        fs.save().unwrap();
    }

    let fs = LogVfs::open(&path, false).unwrap();
    assert_eq!(fs.file_read("/kept/f").unwrap(), b"durable");
    assert!(fs.get("/kept").unwrap().is_dir());
}

#[test]
fn file_handles_follow_the_session_state_machine() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(&dir);

    fs.file_create("/f").unwrap();
    fs.file_write("/f", b"0123456789").unwrap();

    // Read-only sessions cannot write.
    let mut handle = fs.open_file("/f", OpenMode::Read).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(handle.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    match handle.write(b"nope") {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    handle.close().unwrap();

    // Read-write sessions commit on close; until then readers see the
    // old image.
    let mut handle = fs.open_file("/f", OpenMode::ReadWrite).unwrap();
    handle.seek(SeekFrom::Start(5)).unwrap();
    handle.write(b"XYZ").unwrap();
    assert_eq!(fs.file_read("/f").unwrap(), b"0123456789");
    handle.close().unwrap();
    assert_eq!(fs.file_read("/f").unwrap(), b"01234XYZ89");

    // Append sessions always land at the end.
    let mut handle = fs.open_file("/f", OpenMode::Append).unwrap();
    handle.seek(SeekFrom::Start(0)).unwrap();
    handle.write(b"!").unwrap();
    handle.close().unwrap();
    assert_eq!(fs.file_read("/f").unwrap(), b"01234XYZ89!");

    // Write sessions truncate on open.
    let mut handle = fs.open_file("/f", OpenMode::Write).unwrap();
    assert_eq!(fs.file_read("/f").unwrap(), b"");
    handle.write(b"new").unwrap();
    handle.close().unwrap();
    assert_eq!(fs.file_read("/f").unwrap(), b"new");

    // A closed handle rejects everything.
    match handle.write(b"late") {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn local_backend_honors_the_same_contract() {
    let dir = TempDir::new().unwrap();
    let fs = LocalVfs::open(dir.path().join("local")).unwrap();

    fs.dir_create("/a").unwrap();
    fs.file_create("/a/f.txt").unwrap();
    fs.file_write("/a/f.txt", b"hello").unwrap();
    fs.file_concatenate("/a/f.txt", b" world").unwrap();
    assert_eq!(fs.file_read("/a/f.txt").unwrap(), b"hello world");

    let entry = fs.get("/a/f.txt").unwrap();
    assert!(entry.is_file());
    assert_eq!(entry.metadata().size, 11);
    assert_eq!(fs.get_path(&entry).unwrap(), "/a/f.txt");

    fs.copy("/a", "/b").unwrap();
    assert_eq!(fs.file_read("/b/f.txt").unwrap(), b"hello world");

    fs.rename("/a/f.txt", "/a/g.txt").unwrap();
    assert!(!fs.exists("/a/f.txt"));
    assert_eq!(fs.file_read("/a/g.txt").unwrap(), b"hello world");

    fs.dir_delete("/a").unwrap();
    assert!(!fs.exists("/a"));
    assert!(fs.exists("/b/f.txt"));
}

#[cfg(unix)]
#[test]
fn local_backend_symlinks() {
    let dir = TempDir::new().unwrap();
    let fs = LocalVfs::open(dir.path().join("local")).unwrap();

    fs.file_create("/target").unwrap();
    fs.link_create("/target", "/ln").unwrap();
    assert_eq!(fs.link_read("/ln").unwrap(), "/target");
    assert!(fs.get("/ln").unwrap().is_symlink());
    fs.link_delete("/ln").unwrap();
    assert!(!fs.exists("/ln"));
}

#[test]
fn nested_mounts_dispatch_by_prefix() {
    let dir = TempDir::new().unwrap();
    let docs = LogVfs::open(dir.path().join("docs"), false).unwrap();
    let media = LogVfs::open(dir.path().join("media"), false).unwrap();

    let nested = NestedVfs::new();
    nested.mount("/docs", Box::new(docs.clone())).unwrap();
    nested.mount("/media", Box::new(media)).unwrap();

    // Overlapping mounts are refused.
    let spare = LogVfs::open(dir.path().join("spare"), false).unwrap();
    match nested.mount("/docs/sub", Box::new(spare)) {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }

    nested.file_create("/docs/readme.md").unwrap();
    nested.file_write("/docs/readme.md", b"# hi").unwrap();
    assert_eq!(nested.file_read("/docs/readme.md").unwrap(), b"# hi");
    // The write really landed in the child filesystem.
    assert_eq!(docs.file_read("/readme.md").unwrap(), b"# hi");

    let mut names: Vec<String> = nested
        .dir_list("/")
        .unwrap()
        .iter()
        .map(|entry| entry.name().to_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["docs".to_owned(), "media".to_owned()]);

    assert!(nested.exists("/docs"));
    assert!(!nested.exists("/elsewhere"));
}

#[test]
fn nested_operations_across_mounts() {
    let dir = TempDir::new().unwrap();
    let left = LogVfs::open(dir.path().join("left"), false).unwrap();
    let right = LogVfs::open(dir.path().join("right"), false).unwrap();

    let nested = NestedVfs::new();
    nested.mount("/left", Box::new(left)).unwrap();
    nested.mount("/right", Box::new(right)).unwrap();

    nested.dir_create("/left/a").unwrap();
    nested.file_create("/left/a/f").unwrap();
    nested.file_write("/left/a/f", b"across").unwrap();

    // Copy crosses mounts through the contract.
    nested.copy("/left/a", "/right/a").unwrap();
    assert_eq!(nested.file_read("/right/a/f").unwrap(), b"across");
    assert!(nested.exists("/left/a"));

    // Rename cannot cross mounts; move falls back to copy + delete.
    match nested.rename("/left/a/f", "/right/b") {
        Err(StoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    nested.move_entry("/left/a/f", "/right/moved").unwrap();
    assert!(!nested.exists("/left/a/f"));
    assert_eq!(nested.file_read("/right/moved").unwrap(), b"across");

    // Within one mount a move is a plain rename.
    nested.move_entry("/right/moved", "/right/renamed").unwrap();
    assert_eq!(nested.file_read("/right/renamed").unwrap(), b"across");
}

#[test]
fn vfs_trait_objects_are_interchangeable() {
    let dir = TempDir::new().unwrap();

    let backends: Vec<Box<dyn Vfs>> = vec![
        Box::new(LogVfs::open(dir.path().join("log"), false).unwrap()),
        Box::new(LocalVfs::open(dir.path().join("local")).unwrap()),
    ];

    for fs in &backends {
        fs.dir_create("/shared").unwrap();
        fs.file_create("/shared/f").unwrap();
        fs.file_write("/shared/f", b"same contract").unwrap();
        assert_eq!(fs.file_read("/shared/f").unwrap(), b"same contract");
        let root = fs.root_get().unwrap();
        assert!(root.is_dir());
        fs.dir_delete("/shared").unwrap();
        assert!(!fs.exists("/shared"));
    }
}
