use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::kvlog::{KeySize, KvLog, LogConfig};
use crate::{Result, StoreError};

use super::entry::{DirEntry, Entry, FileEntry, FileType, Metadata, SymlinkEntry};
use super::path;
use super::Vfs;

/// Record id of the root directory in the metadata log.
const ROOT_ID: u32 = 1;

/// File payloads are split into chunks of at most this many bytes, so
/// every chunk fits a compact log record.
const CHUNK_SIZE: usize = 32 * 1024;

/// Filesystem persisted through two append-only record logs: one for
/// entry metadata (one JSON record per entry, record id == entry id) and
/// one for file payload chunks.
///
/// Clones share the same filesystem. Reads proceed in parallel; mutations
/// are exclusive.
#[derive(Clone)]
pub struct LogVfs {
    inner: Arc<RwLock<VfsInner>>,
}

struct VfsInner {
    path: PathBuf,
    meta: KvLog,
    data: KvLog,
}

impl LogVfs {
    /// Opens (or creates) a filesystem rooted at `path`. With `reset` the
    /// existing contents are wiped first. The root directory entry is
    /// created on first open.
    pub fn open(path: impl Into<PathBuf>, reset: bool) -> Result<LogVfs> {
        let path = path.into();
        if reset && path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        let meta = KvLog::open(LogConfig::new(path.join("meta")))?;
        let mut data_config = LogConfig::new(path.join("data"));
        data_config.keysize = KeySize::Six;
        let data = KvLog::open(data_config)?;

        if !meta.exists(ROOT_ID) {
            let mut metadata = Metadata::new("/", FileType::Directory);
            metadata.id = ROOT_ID;
            let root = Entry::Dir(DirEntry {
                metadata,
                parent_id: 0,
                children: Vec::new(),
            });
            let id = meta.set(None, &root.encode()?)?;
            if id != ROOT_ID {
                return Err(StoreError::Corrupt(format!(
                    "filesystem has no root but allocated id {}",
                    id
                )));
            }
        }

        Ok(LogVfs {
            inner: Arc::new(RwLock::new(VfsInner { path, meta, data })),
        })
    }

    /// Flushes pending writes and snapshots both logs' lookups.
    pub fn save(&self) -> Result<()> {
        let inner = self.inner.write().unwrap();
        inner.meta.save()?;
        inner.data.save()
    }

    /// Flushes and snapshots; the filesystem stays usable.
    pub fn close(&self) -> Result<()> {
        self.save()
    }
}

impl Vfs for LogVfs {
    fn root_get(&self) -> Result<Entry> {
        let inner = self.inner.read().unwrap();
        inner.read_entry(ROOT_ID)
    }

    fn get(&self, path: &str) -> Result<Entry> {
        let inner = self.inner.read().unwrap();
        inner.resolve(&path::normalize(path)?)
    }

    fn exists(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    fn get_path(&self, entry: &Entry) -> Result<String> {
        let inner = self.inner.read().unwrap();
        inner.path_of(entry.id())
    }

    fn file_create(&self, path: &str) -> Result<Entry> {
        let inner = self.inner.write().unwrap();
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(StoreError::AlreadyExists(path));
        }
        let (parent_path, name) = path::split_parent(&path);
        let mut parent = inner.resolve_dir(&parent_path)?;
        if inner.find_child(&parent, &name)?.is_some() {
            return Err(StoreError::AlreadyExists(path));
        }

        let file = Entry::File(FileEntry {
            metadata: Metadata::new(&name, FileType::File),
            parent_id: parent.metadata.id,
            chunk_ids: Vec::new(),
        });
        inner.attach(&mut parent, file)
    }

    fn file_read(&self, path: &str) -> Result<Vec<u8>> {
        let inner = self.inner.read().unwrap();
        let path = path::normalize(path)?;
        let file = inner.resolve_file(&path)?;
        inner.read_chunks(&file.chunk_ids)
    }

    fn file_write(&self, path: &str, data: &[u8]) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let path = path::normalize(path)?;
        let mut file = inner.resolve_file(&path)?;

        // New payload first, entry second, stale chunks last: a crash in
        // between leaves orphan chunks, never a dangling entry.
        let old_chunks = std::mem::replace(&mut file.chunk_ids, inner.write_chunks(data)?);
        file.metadata.size = data.len() as u64;
        file.metadata.touch();
        inner.write_entry(&Entry::File(file))?;
        inner.delete_chunks(&old_chunks)
    }

    fn file_concatenate(&self, path: &str, data: &[u8]) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let path = path::normalize(path)?;
        let mut file = inner.resolve_file(&path)?;

        file.chunk_ids.extend(inner.write_chunks(data)?);
        file.metadata.size += data.len() as u64;
        file.metadata.touch();
        inner.write_entry(&Entry::File(file))
    }

    fn file_delete(&self, path: &str) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let path = path::normalize(path)?;
        let file = inner.resolve_file(&path)?;
        inner.delete_chunks(&file.chunk_ids)?;
        inner.meta.delete(file.metadata.id)?;
        inner.detach(file.parent_id, file.metadata.id)
    }

    fn dir_create(&self, path: &str) -> Result<Entry> {
        let inner = self.inner.write().unwrap();
        let path = path::normalize(path)?;

        let mut current = inner.read_entry(ROOT_ID)?;
        let mut walked = String::new();
        for segment in path::segments(&path) {
            walked = path::join(if walked.is_empty() { "/" } else { walked.as_str() }, segment);
            let mut dir = match current {
                Entry::Dir(dir) => dir,
                _ => return Err(StoreError::NotDirectory(walked)),
            };
            current = match inner.find_child(&dir, segment)? {
                Some(Entry::Dir(next)) => Entry::Dir(next),
                Some(_) => return Err(StoreError::NotDirectory(walked)),
                None => {
                    let child = Entry::Dir(DirEntry {
                        metadata: Metadata::new(segment, FileType::Directory),
                        parent_id: dir.metadata.id,
                        children: Vec::new(),
                    });
                    inner.attach(&mut dir, child)?
                }
            };
        }
        Ok(current)
    }

    fn dir_list(&self, path: &str) -> Result<Vec<Entry>> {
        let inner = self.inner.read().unwrap();
        let path = path::normalize(path)?;
        let dir = inner.resolve_dir(&path)?;
        let mut entries = Vec::with_capacity(dir.children.len());
        for &child_id in &dir.children {
            entries.push(inner.read_entry(child_id)?);
        }
        Ok(entries)
    }

    fn dir_delete(&self, path: &str) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(StoreError::InvalidArgument(
                "cannot delete the root directory".to_owned(),
            ));
        }
        let dir = inner.resolve_dir(&path)?;
        inner.delete_tree(dir.metadata.id)?;
        inner.detach(dir.parent_id, dir.metadata.id)
    }

    fn link_create(&self, target: &str, link_path: &str) -> Result<Entry> {
        let inner = self.inner.write().unwrap();
        let link_path = path::normalize(link_path)?;
        if link_path == "/" {
            return Err(StoreError::AlreadyExists(link_path));
        }
        let (parent_path, name) = path::split_parent(&link_path);
        let mut parent = inner.resolve_dir(&parent_path)?;
        if inner.find_child(&parent, &name)?.is_some() {
            return Err(StoreError::AlreadyExists(link_path));
        }

        let mut metadata = Metadata::new(&name, FileType::Symlink);
        metadata.size = target.len() as u64;
        let link = Entry::Symlink(SymlinkEntry {
            metadata,
            parent_id: parent.metadata.id,
            target: target.to_owned(),
        });
        inner.attach(&mut parent, link)
    }

    fn link_read(&self, path: &str) -> Result<String> {
        let inner = self.inner.read().unwrap();
        let path = path::normalize(path)?;
        match inner.resolve(&path)? {
            Entry::Symlink(link) => Ok(link.target),
            _ => Err(StoreError::NotSymlink(path)),
        }
    }

    fn link_delete(&self, path: &str) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let path = path::normalize(path)?;
        let link = match inner.resolve(&path)? {
            Entry::Symlink(link) => link,
            _ => return Err(StoreError::NotSymlink(path)),
        };
        inner.meta.delete(link.metadata.id)?;
        inner.detach(link.parent_id, link.metadata.id)
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<Entry> {
        let inner = self.inner.write().unwrap();
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;
        if old_path == "/" {
            return Err(StoreError::InvalidArgument(
                "cannot rename the root directory".to_owned(),
            ));
        }
        if path::is_within(&old_path, &new_path) {
            return Err(StoreError::InvalidArgument(format!(
                "cannot move {:?} into itself",
                old_path
            )));
        }

        let mut entry = inner.resolve(&old_path)?;
        let (new_parent_path, new_name) = path::split_parent(&new_path);
        let mut new_parent = inner.resolve_dir(&new_parent_path)?;
        if inner.find_child(&new_parent, &new_name)?.is_some() {
            return Err(StoreError::AlreadyExists(new_path));
        }

        let old_parent_id = entry.parent_id();
        entry.metadata_mut().name = new_name;
        entry.set_parent_id(new_parent.metadata.id);
        entry.metadata_mut().touch();
        inner.write_entry(&entry)?;

        if old_parent_id == new_parent.metadata.id {
            new_parent.metadata.touch();
            inner.write_entry(&Entry::Dir(new_parent))?;
        } else {
            inner.detach(old_parent_id, entry.id())?;
            new_parent.children.push(entry.id());
            new_parent.metadata.touch();
            inner.write_entry(&Entry::Dir(new_parent))?;
        }
        Ok(entry)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<Entry> {
        let inner = self.inner.write().unwrap();
        let src = path::normalize(src)?;
        let dst = path::normalize(dst)?;
        if dst == "/" {
            return Err(StoreError::AlreadyExists(dst));
        }
        let entry = inner.resolve(&src)?;
        if entry.is_dir() && path::is_within(&src, &dst) {
            return Err(StoreError::InvalidArgument(format!(
                "cannot copy {:?} into itself",
                src
            )));
        }

        let (dst_parent_path, dst_name) = path::split_parent(&dst);
        let mut dst_parent = inner.resolve_dir(&dst_parent_path)?;
        if inner.find_child(&dst_parent, &dst_name)?.is_some() {
            return Err(StoreError::AlreadyExists(dst));
        }

        let copied = inner.copy_tree(&entry, dst_parent.metadata.id, &dst_name)?;
        dst_parent.children.push(copied.id());
        dst_parent.metadata.touch();
        inner.write_entry(&Entry::Dir(dst_parent))?;
        Ok(copied)
    }

    fn move_entry(&self, src: &str, dst: &str) -> Result<Entry> {
        // Within one filesystem a move is a rename.
        self.rename(src, dst)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let kind = self.get(path)?.metadata().file_type;
        match kind {
            FileType::Directory => self.dir_delete(path),
            FileType::File => self.file_delete(path),
            FileType::Symlink => self.link_delete(path),
        }
    }

    fn destroy(&self) -> Result<()> {
        let inner = self.inner.write().unwrap();
        inner.meta.destroy()?;
        inner.data.destroy()?;
        fs::remove_dir_all(&inner.path)?;
        Ok(())
    }
}

impl VfsInner {
    fn read_entry(&self, id: u32) -> Result<Entry> {
        Entry::decode(&self.meta.get(id)?)
    }

    fn write_entry(&self, entry: &Entry) -> Result<()> {
        self.meta.set(Some(entry.id()), &entry.encode()?)?;
        Ok(())
    }

    /// Writes a brand-new entry record and returns the entry with its
    /// allocated id filled in. Callers hold the write lock, so the
    /// predicted id cannot race another allocation.
    fn create_entry(&self, mut entry: Entry) -> Result<Entry> {
        let id = self.meta.get_next_id()?;
        entry.metadata_mut().id = id;
        let got = self.meta.set(None, &entry.encode()?)?;
        if got != id {
            return Err(StoreError::Corrupt(format!(
                "expected to allocate entry id {}, got {}",
                id, got
            )));
        }
        Ok(entry)
    }

    /// Walks a normalized path from the root. Symlinks are not followed;
    /// a non-directory in the middle of the path is a kind error.
    fn resolve(&self, path: &str) -> Result<Entry> {
        let mut current = self.read_entry(ROOT_ID)?;
        for segment in path::segments(path) {
            let dir = match &current {
                Entry::Dir(dir) => dir,
                _ => return Err(StoreError::NotDirectory(path.to_owned())),
            };
            current = self
                .find_child(dir, segment)?
                .ok_or_else(|| StoreError::NotFound(path.to_owned()))?;
        }
        Ok(current)
    }

    fn resolve_dir(&self, path: &str) -> Result<DirEntry> {
        match self.resolve(path)? {
            Entry::Dir(dir) => Ok(dir),
            _ => Err(StoreError::NotDirectory(path.to_owned())),
        }
    }

    fn resolve_file(&self, path: &str) -> Result<FileEntry> {
        match self.resolve(path)? {
            Entry::File(file) => Ok(file),
            _ => Err(StoreError::NotFile(path.to_owned())),
        }
    }

    /// Child of `dir` named `name`, if any. Directories are small enough
    /// that a linear scan over the children is fine.
    fn find_child(&self, dir: &DirEntry, name: &str) -> Result<Option<Entry>> {
        for &child_id in &dir.children {
            let child = self.read_entry(child_id)?;
            if child.name() == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Creates `child` under `parent`: the child record is written first,
    /// then the parent's children list.
    fn attach(&self, parent: &mut DirEntry, child: Entry) -> Result<Entry> {
        let child = self.create_entry(child)?;
        parent.children.push(child.id());
        parent.metadata.touch();
        self.write_entry(&Entry::Dir(parent.clone()))?;
        Ok(child)
    }

    /// Drops `child_id` from the children of directory `parent_id`.
    fn detach(&self, parent_id: u32, child_id: u32) -> Result<()> {
        let mut parent = match self.read_entry(parent_id)? {
            Entry::Dir(dir) => dir,
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "parent {} of entry {} is not a directory",
                    parent_id, child_id
                )));
            }
        };
        parent.children.retain(|&id| id != child_id);
        parent.metadata.touch();
        self.write_entry(&Entry::Dir(parent))
    }

    fn write_chunks(&self, data: &[u8]) -> Result<Vec<u32>> {
        let mut chunk_ids = Vec::new();
        for chunk in data.chunks(CHUNK_SIZE) {
            chunk_ids.push(self.data.set(None, chunk)?);
        }
        Ok(chunk_ids)
    }

    fn read_chunks(&self, chunk_ids: &[u32]) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        for &chunk_id in chunk_ids {
            payload.extend_from_slice(&self.data.get(chunk_id)?);
        }
        Ok(payload)
    }

    fn delete_chunks(&self, chunk_ids: &[u32]) -> Result<()> {
        for &chunk_id in chunk_ids {
            self.data.delete(chunk_id)?;
        }
        Ok(())
    }

    /// Depth-first recursive delete: children first, then the entry, so a
    /// partial failure leaves already-deleted subtrees removed.
    fn delete_tree(&self, id: u32) -> Result<()> {
        match self.read_entry(id)? {
            Entry::Dir(dir) => {
                for child_id in dir.children {
                    self.delete_tree(child_id)?;
                }
            }
            Entry::File(file) => {
                self.delete_chunks(&file.chunk_ids)?;
            }
            Entry::Symlink(_) => {}
        }
        self.meta.delete(id)
    }

    /// Deep copy of `src` as a child of `dst_parent_id` named `name`.
    /// New ids are allocated throughout; payload chunks are re-written.
    fn copy_tree(&self, src: &Entry, dst_parent_id: u32, name: &str) -> Result<Entry> {
        match src {
            Entry::File(file) => {
                let payload = self.read_chunks(&file.chunk_ids)?;
                let chunk_ids = self.write_chunks(&payload)?;
                let mut metadata = file.metadata.clone();
                metadata.id = 0;
                metadata.name = name.to_owned();
                metadata.touch();
                self.create_entry(Entry::File(FileEntry {
                    metadata,
                    parent_id: dst_parent_id,
                    chunk_ids,
                }))
            }
            Entry::Symlink(link) => {
                let mut metadata = link.metadata.clone();
                metadata.id = 0;
                metadata.name = name.to_owned();
                metadata.touch();
                self.create_entry(Entry::Symlink(SymlinkEntry {
                    metadata,
                    parent_id: dst_parent_id,
                    target: link.target.clone(),
                }))
            }
            Entry::Dir(dir) => {
                let mut metadata = dir.metadata.clone();
                metadata.id = 0;
                metadata.name = name.to_owned();
                metadata.touch();
                let copied = self.create_entry(Entry::Dir(DirEntry {
                    metadata,
                    parent_id: dst_parent_id,
                    children: Vec::new(),
                }))?;
                let copied_id = copied.id();

                let mut children = Vec::with_capacity(dir.children.len());
                for &child_id in &dir.children {
                    let child = self.read_entry(child_id)?;
                    let child_name = child.name().to_owned();
                    children.push(self.copy_tree(&child, copied_id, &child_name)?.id());
                }

                let mut copied_dir = match copied {
                    Entry::Dir(dir) => dir,
                    _ => unreachable!("created entry is a directory"),
                };
                copied_dir.children = children;
                let copied = Entry::Dir(copied_dir);
                self.write_entry(&copied)?;
                Ok(copied)
            }
        }
    }

    /// Rebuilds the absolute path of entry `id` by walking parent links.
    fn path_of(&self, id: u32) -> Result<String> {
        if id == ROOT_ID {
            return Ok("/".to_owned());
        }
        let mut parts = Vec::new();
        let mut current = id;
        // Parent chains are trees; a walk longer than the entry count
        // means a corrupt chain.
        let mut hops = self.meta.len();
        loop {
            let entry = self.read_entry(current)?;
            parts.push(entry.name().to_owned());
            current = entry.parent_id();
            if current == ROOT_ID {
                break;
            }
            if current == 0 || hops == 0 {
                return Err(StoreError::Corrupt(format!(
                    "broken parent chain above entry {}",
                    id
                )));
            }
            hops -= 1;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }
}
