use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Result, StoreError};

use super::entry::{DirEntry, Entry, FileEntry, FileType, Metadata, SymlinkEntry};
use super::path;
use super::Vfs;

/// Filesystem contract mapped onto a directory of the host filesystem.
///
/// Entry ids are interned per instance: the first time a path is seen it
/// gets the next id, and the id keeps naming that path until the entry is
/// moved or removed. Symlink operations require a unix host.
#[derive(Clone)]
pub struct LocalVfs {
    inner: Arc<RwLock<LocalInner>>,
}

struct LocalInner {
    root: PathBuf,
    ids: HashMap<String, u32>,
    paths: HashMap<u32, String>,
    next_id: u32,
}

impl LocalVfs {
    /// Opens (or creates) the host directory `root` and exposes it as a
    /// filesystem.
    pub fn open(root: impl Into<PathBuf>) -> Result<LocalVfs> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut inner = LocalInner {
            root,
            ids: HashMap::new(),
            paths: HashMap::new(),
            next_id: 1,
        };
        inner.intern("/");
        Ok(LocalVfs {
            inner: Arc::new(RwLock::new(inner)),
        })
    }
}

impl LocalInner {
    fn host_path(&self, vpath: &str) -> PathBuf {
        if vpath == "/" {
            self.root.clone()
        } else {
            self.root.join(&vpath[1..])
        }
    }

    fn intern(&mut self, vpath: &str) -> u32 {
        if let Some(&id) = self.ids.get(vpath) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(vpath.to_owned(), id);
        self.paths.insert(id, vpath.to_owned());
        id
    }

    fn forget(&mut self, vpath: &str) {
        // Drop the mapping of the path and everything below it.
        let doomed: Vec<String> = self
            .ids
            .keys()
            .filter(|p| path::is_within(vpath, p))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(id) = self.ids.remove(&p) {
                self.paths.remove(&id);
            }
        }
    }

    /// Builds an [`Entry`] from the host metadata of `vpath`. Symlinks
    /// are described, not followed.
    fn entry_for(&mut self, vpath: &str) -> Result<Entry> {
        let host = self.host_path(vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, vpath))?;

        let name = if vpath == "/" {
            "/".to_owned()
        } else {
            path::split_parent(vpath).1
        };
        let parent_id = if vpath == "/" {
            0
        } else {
            let parent = path::split_parent(vpath).0;
            self.intern(&parent)
        };
        let id = self.intern(vpath);

        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };

        let mut common = Metadata::new(&name, file_type);
        common.id = id;
        common.size = if file_type == FileType::File {
            meta.len()
        } else if file_type == FileType::Symlink {
            fs::read_link(&host)?.to_string_lossy().len() as u64
        } else {
            0
        };
        common.modified_at = unix_seconds(meta.modified().ok());
        common.accessed_at = unix_seconds(meta.accessed().ok());
        common.created_at = unix_seconds(meta.created().ok());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            common.mode = meta.permissions().mode() & 0o7777;
        }

        Ok(match file_type {
            FileType::Directory => {
                let mut children = Vec::new();
                for child in fs::read_dir(&host)? {
                    let child = child?;
                    let child_name = child.file_name().to_string_lossy().into_owned();
                    children.push(self.intern(&path::join(vpath, &child_name)));
                }
                Entry::Dir(DirEntry {
                    metadata: common,
                    parent_id,
                    children,
                })
            }
            FileType::File => Entry::File(FileEntry {
                metadata: common,
                parent_id,
                chunk_ids: Vec::new(),
            }),
            FileType::Symlink => Entry::Symlink(SymlinkEntry {
                metadata: common,
                parent_id,
                target: fs::read_link(&host)?.to_string_lossy().into_owned(),
            }),
        })
    }
}

impl Vfs for LocalVfs {
    fn root_get(&self) -> Result<Entry> {
        let mut inner = self.inner.write().unwrap();
        inner.entry_for("/")
    }

    fn get(&self, vpath: &str) -> Result<Entry> {
        let mut inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        inner.entry_for(&vpath)
    }

    fn exists(&self, vpath: &str) -> bool {
        let inner = self.inner.read().unwrap();
        match path::normalize(vpath) {
            Ok(vpath) => fs::symlink_metadata(inner.host_path(&vpath)).is_ok(),
            Err(_) => false,
        }
    }

    fn get_path(&self, entry: &Entry) -> Result<String> {
        let inner = self.inner.read().unwrap();
        inner
            .paths
            .get(&entry.id())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("entry id {}", entry.id())))
    }

    fn file_create(&self, vpath: &str) -> Result<Entry> {
        let mut inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        if fs::symlink_metadata(&host).is_ok() {
            return Err(StoreError::AlreadyExists(vpath));
        }
        let parent = path::split_parent(&vpath).0;
        match fs::symlink_metadata(inner.host_path(&parent)) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StoreError::NotDirectory(parent)),
            Err(_) => return Err(StoreError::NotFound(vpath)),
        }
        fs::File::create(&host)?;
        inner.entry_for(&vpath)
    }

    fn file_read(&self, vpath: &str) -> Result<Vec<u8>> {
        let inner = self.inner.read().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, &vpath))?;
        if !meta.is_file() {
            return Err(StoreError::NotFile(vpath));
        }
        Ok(fs::read(&host)?)
    }

    fn file_write(&self, vpath: &str, data: &[u8]) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, &vpath))?;
        if !meta.is_file() {
            return Err(StoreError::NotFile(vpath));
        }
        fs::write(&host, data)?;
        Ok(())
    }

    fn file_concatenate(&self, vpath: &str, data: &[u8]) -> Result<()> {
        let inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, &vpath))?;
        if !meta.is_file() {
            return Err(StoreError::NotFile(vpath));
        }
        let mut file = fs::OpenOptions::new().append(true).open(&host)?;
        file.write_all(data)?;
        Ok(())
    }

    fn file_delete(&self, vpath: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, &vpath))?;
        if !meta.is_file() {
            return Err(StoreError::NotFile(vpath));
        }
        fs::remove_file(&host)?;
        inner.forget(&vpath);
        Ok(())
    }

    fn dir_create(&self, vpath: &str) -> Result<Entry> {
        let mut inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        if let Ok(meta) = fs::symlink_metadata(&host) {
            if !meta.is_dir() {
                return Err(StoreError::NotDirectory(vpath));
            }
        } else {
            fs::create_dir_all(&host)?;
        }
        inner.entry_for(&vpath)
    }

    fn dir_list(&self, vpath: &str) -> Result<Vec<Entry>> {
        let mut inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        let dir = match inner.entry_for(&vpath)? {
            Entry::Dir(dir) => dir,
            _ => return Err(StoreError::NotDirectory(vpath)),
        };
        let host = inner.host_path(&vpath);
        let mut entries = Vec::with_capacity(dir.children.len());
        for child in fs::read_dir(&host)? {
            let child = child?;
            let child_name = child.file_name().to_string_lossy().into_owned();
            entries.push(inner.entry_for(&path::join(&vpath, &child_name))?);
        }
        Ok(entries)
    }

    fn dir_delete(&self, vpath: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        if vpath == "/" {
            return Err(StoreError::InvalidArgument(
                "cannot delete the root directory".to_owned(),
            ));
        }
        let host = inner.host_path(&vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, &vpath))?;
        if !meta.is_dir() {
            return Err(StoreError::NotDirectory(vpath));
        }
        fs::remove_dir_all(&host)?;
        inner.forget(&vpath);
        Ok(())
    }

    #[cfg(unix)]
    fn link_create(&self, target: &str, link_path: &str) -> Result<Entry> {
        let mut inner = self.inner.write().unwrap();
        let link_path = path::normalize(link_path)?;
        let host = inner.host_path(&link_path);
        if fs::symlink_metadata(&host).is_ok() {
            return Err(StoreError::AlreadyExists(link_path));
        }
        std::os::unix::fs::symlink(target, &host)?;
        inner.entry_for(&link_path)
    }

    #[cfg(not(unix))]
    fn link_create(&self, _target: &str, _link_path: &str) -> Result<Entry> {
        Err(StoreError::InvalidArgument(
            "symlinks are not supported on this host".to_owned(),
        ))
    }

    fn link_read(&self, vpath: &str) -> Result<String> {
        let inner = self.inner.read().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, &vpath))?;
        if !meta.file_type().is_symlink() {
            return Err(StoreError::NotSymlink(vpath));
        }
        Ok(fs::read_link(&host)?.to_string_lossy().into_owned())
    }

    fn link_delete(&self, vpath: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let vpath = path::normalize(vpath)?;
        let host = inner.host_path(&vpath);
        let meta = fs::symlink_metadata(&host).map_err(|e| not_found(e, &vpath))?;
        if !meta.file_type().is_symlink() {
            return Err(StoreError::NotSymlink(vpath));
        }
        fs::remove_file(&host)?;
        inner.forget(&vpath);
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<Entry> {
        let mut inner = self.inner.write().unwrap();
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

        let old_host = inner.host_path(&old_path);
        fs::symlink_metadata(&old_host).map_err(|e| not_found(e, &old_path))?;
        let new_host = inner.host_path(&new_path);
        if fs::symlink_metadata(&new_host).is_ok() {
            return Err(StoreError::AlreadyExists(new_path));
        }
        let new_parent = path::split_parent(&new_path).0;
        if !fs::symlink_metadata(inner.host_path(&new_parent))
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(StoreError::NotFound(new_path));
        }

        fs::rename(&old_host, &new_host)?;
        inner.forget(&old_path);
        inner.entry_for(&new_path)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<Entry> {
        {
            let inner = self.inner.read().unwrap();
            let src = path::normalize(src)?;
            let dst = path::normalize(dst)?;
            if path::is_within(&src, &dst) {
                return Err(StoreError::InvalidArgument(format!(
                    "cannot copy {:?} into itself",
                    src
                )));
            }
            if fs::symlink_metadata(inner.host_path(&dst)).is_ok() {
                return Err(StoreError::AlreadyExists(dst));
            }
            let src_host = inner.host_path(&src);
            fs::symlink_metadata(&src_host).map_err(|e| not_found(e, &src))?;
            copy_host_tree(&src_host, &inner.host_path(&dst))?;
        }
        self.get(dst)
    }

    fn move_entry(&self, src: &str, dst: &str) -> Result<Entry> {
        self.rename(src, dst)
    }

    fn delete(&self, vpath: &str) -> Result<()> {
        match self.get(vpath)?.metadata().file_type {
            FileType::Directory => self.dir_delete(vpath),
            FileType::File => self.file_delete(vpath),
            FileType::Symlink => self.link_delete(vpath),
        }
    }

    fn destroy(&self) -> Result<()> {
        let inner = self.inner.write().unwrap();
        fs::remove_dir_all(&inner.root)?;
        Ok(())
    }
}

/// Recursive host-side copy; symlinks are re-created, not followed.
fn copy_host_tree(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        #[cfg(unix)]
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
        #[cfg(not(unix))]
        return Err(StoreError::InvalidArgument(
            "symlinks are not supported on this host".to_owned(),
        ));
    } else if meta.is_dir() {
        fs::create_dir_all(dst)?;
        for child in fs::read_dir(src)? {
            let child = child?;
            copy_host_tree(&child.path(), &dst.join(child.file_name()))?;
        }
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

fn not_found(e: io::Error, vpath: &str) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(vpath.to_owned())
    } else {
        StoreError::Io(e)
    }
}

fn unix_seconds(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
