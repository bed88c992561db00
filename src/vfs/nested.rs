use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::{Result, StoreError};

use super::entry::{DirEntry, Entry, FileType, Metadata};
use super::path;
use super::{copy_tree, Vfs};

/// Composite filesystem: child filesystems mounted under path prefixes.
///
/// Every operation strips the longest matching mount prefix and
/// dispatches to that child. Prefixes are disjoint (no mount is an
/// ancestor of another). Paths above the mounts form a synthetic
/// read-only directory tree.
pub struct NestedVfs {
    inner: Arc<RwLock<Vec<Mount>>>,
}

struct Mount {
    prefix: String,
    fs: Box<dyn Vfs>,
}

impl NestedVfs {
    /// An empty composite with no mounts.
    pub fn new() -> NestedVfs {
        NestedVfs {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Mounts `fs` under `prefix`. The prefix must be an absolute
    /// non-root path and must not nest with an existing mount.
    pub fn mount(&self, prefix: &str, fs: Box<dyn Vfs>) -> Result<()> {
        let prefix = path::normalize(prefix)?;
        if prefix == "/" {
            return Err(StoreError::InvalidArgument(
                "cannot mount over the root".to_owned(),
            ));
        }
        let mut mounts = self.inner.write().unwrap();
        for mount in mounts.iter() {
            if path::is_within(&mount.prefix, &prefix) || path::is_within(&prefix, &mount.prefix) {
                return Err(StoreError::InvalidArgument(format!(
                    "mount {:?} overlaps existing mount {:?}",
                    prefix, mount.prefix
                )));
            }
        }
        mounts.push(Mount { prefix, fs });
        Ok(())
    }

    /// Runs `op` against the child owning `vpath` with the prefix
    /// stripped.
    fn dispatch<T>(&self, vpath: &str, op: impl FnOnce(&dyn Vfs, &str) -> Result<T>) -> Result<T> {
        let mounts = self.inner.read().unwrap();
        let vpath = path::normalize(vpath)?;
        match longest_mount(&mounts, &vpath) {
            Some((mount, rest)) => op(mount.fs.as_ref(), &rest),
            None => Err(StoreError::NotFound(vpath)),
        }
    }

    /// Entry names of the synthetic directory at `vpath`: the next
    /// segment of every mount below it.
    fn synthetic_children(&self, vpath: &str) -> Option<Vec<String>> {
        let mounts = self.inner.read().unwrap();
        let mut names = BTreeSet::new();
        for mount in mounts.iter() {
            if vpath == "/" || path::is_within(vpath, &mount.prefix) {
                if mount.prefix != vpath {
                    let below = if vpath == "/" {
                        &mount.prefix[1..]
                    } else {
                        &mount.prefix[vpath.len() + 1..]
                    };
                    let first = below.split('/').next().expect("split yields a segment");
                    names.insert(first.to_owned());
                }
            }
        }
        if names.is_empty() && vpath != "/" {
            None
        } else {
            Some(names.into_iter().collect())
        }
    }

    fn synthetic_dir(&self, name: &str) -> Entry {
        Entry::Dir(DirEntry {
            metadata: Metadata::new(name, FileType::Directory),
            parent_id: 0,
            children: Vec::new(),
        })
    }
}

impl Default for NestedVfs {
    fn default() -> Self {
        NestedVfs::new()
    }
}

impl Vfs for NestedVfs {
    fn root_get(&self) -> Result<Entry> {
        Ok(self.synthetic_dir("/"))
    }

    fn get(&self, vpath: &str) -> Result<Entry> {
        let normalized = path::normalize(vpath)?;
        if normalized == "/" {
            return self.root_get();
        }
        match self.dispatch(&normalized, |fs, rest| fs.get(rest)) {
            Err(StoreError::NotFound(_)) => match self.synthetic_children(&normalized) {
                Some(_) => Ok(self.synthetic_dir(&path::split_parent(&normalized).1)),
                None => Err(StoreError::NotFound(normalized)),
            },
            other => other,
        }
    }

    fn exists(&self, vpath: &str) -> bool {
        self.get(vpath).is_ok()
    }

    fn get_path(&self, entry: &Entry) -> Result<String> {
        let mounts = self.inner.read().unwrap();
        for mount in mounts.iter() {
            if let Ok(child_path) = mount.fs.get_path(entry) {
                return Ok(if child_path == "/" {
                    mount.prefix.clone()
                } else {
                    format!("{}{}", mount.prefix, child_path)
                });
            }
        }
        Err(StoreError::NotFound(format!("entry id {}", entry.id())))
    }

    fn file_create(&self, vpath: &str) -> Result<Entry> {
        self.dispatch(vpath, |fs, rest| fs.file_create(rest))
    }

    fn file_read(&self, vpath: &str) -> Result<Vec<u8>> {
        self.dispatch(vpath, |fs, rest| fs.file_read(rest))
    }

    fn file_write(&self, vpath: &str, data: &[u8]) -> Result<()> {
        self.dispatch(vpath, |fs, rest| fs.file_write(rest, data))
    }

    fn file_concatenate(&self, vpath: &str, data: &[u8]) -> Result<()> {
        self.dispatch(vpath, |fs, rest| fs.file_concatenate(rest, data))
    }

    fn file_delete(&self, vpath: &str) -> Result<()> {
        self.dispatch(vpath, |fs, rest| fs.file_delete(rest))
    }

    fn dir_create(&self, vpath: &str) -> Result<Entry> {
        self.dispatch(vpath, |fs, rest| fs.dir_create(rest))
    }

    fn dir_list(&self, vpath: &str) -> Result<Vec<Entry>> {
        let normalized = path::normalize(vpath)?;
        {
            let mounts = self.inner.read().unwrap();
            if let Some((mount, rest)) = longest_mount(&mounts, &normalized) {
                return mount.fs.dir_list(&rest);
            }
        }
        match self.synthetic_children(&normalized) {
            Some(names) => Ok(names.iter().map(|n| self.synthetic_dir(n)).collect()),
            None => Err(StoreError::NotFound(normalized)),
        }
    }

    fn dir_delete(&self, vpath: &str) -> Result<()> {
        self.dispatch(vpath, |fs, rest| fs.dir_delete(rest))
    }

    fn link_create(&self, target: &str, link_path: &str) -> Result<Entry> {
        self.dispatch(link_path, |fs, rest| fs.link_create(target, rest))
    }

    fn link_read(&self, vpath: &str) -> Result<String> {
        self.dispatch(vpath, |fs, rest| fs.link_read(rest))
    }

    fn link_delete(&self, vpath: &str) -> Result<()> {
        self.dispatch(vpath, |fs, rest| fs.link_delete(rest))
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<Entry> {
        let mounts = self.inner.read().unwrap();
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;
        let (old_idx, old_rest) = mount_index(&mounts, &old_path)
            .ok_or_else(|| StoreError::NotFound(old_path.clone()))?;
        let (new_idx, new_rest) = mount_index(&mounts, &new_path)
            .ok_or_else(|| StoreError::NotFound(new_path.clone()))?;
        if old_idx != new_idx {
            // A rename never re-creates entries, so it cannot span
            // filesystems; move_entry degrades to copy + delete instead.
            return Err(StoreError::InvalidArgument(format!(
                "{:?} and {:?} live on different mounts",
                old_path, new_path
            )));
        }
        mounts[old_idx].fs.rename(&old_rest, &new_rest)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<Entry> {
        let src = path::normalize(src)?;
        let dst = path::normalize(dst)?;
        {
            let mounts = self.inner.read().unwrap();
            let (src_idx, src_rest) =
                mount_index(&mounts, &src).ok_or_else(|| StoreError::NotFound(src.clone()))?;
            let (dst_idx, dst_rest) =
                mount_index(&mounts, &dst).ok_or_else(|| StoreError::NotFound(dst.clone()))?;
            if src_idx == dst_idx {
                return mounts[src_idx].fs.copy(&src_rest, &dst_rest);
            }
            copy_tree(
                mounts[src_idx].fs.as_ref(),
                &src_rest,
                mounts[dst_idx].fs.as_ref(),
                &dst_rest,
            )?;
        }
        self.get(&dst)
    }

    fn move_entry(&self, src: &str, dst: &str) -> Result<Entry> {
        let src_n = path::normalize(src)?;
        let dst_n = path::normalize(dst)?;
        let same_mount = {
            let mounts = self.inner.read().unwrap();
            match (mount_index(&mounts, &src_n), mount_index(&mounts, &dst_n)) {
                (Some((a, _)), Some((b, _))) => a == b,
                _ => return Err(StoreError::NotFound(src_n)),
            }
        };
        if same_mount {
            self.rename(src, dst)
        } else {
            // Crossing mounts: deep copy, then remove the source.
            let copied = self.copy(src, dst)?;
            self.delete(src)?;
            Ok(copied)
        }
    }

    fn delete(&self, vpath: &str) -> Result<()> {
        self.dispatch(vpath, |fs, rest| fs.delete(rest))
    }

    fn destroy(&self) -> Result<()> {
        let mounts = self.inner.read().unwrap();
        for mount in mounts.iter() {
            mount.fs.destroy()?;
        }
        Ok(())
    }
}

/// Longest mount owning `vpath`, together with the path inside it.
fn longest_mount<'a>(mounts: &'a [Mount], vpath: &str) -> Option<(&'a Mount, String)> {
    mount_index(mounts, vpath).map(|(idx, rest)| (&mounts[idx], rest))
}

fn mount_index(mounts: &[Mount], vpath: &str) -> Option<(usize, String)> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, mount) in mounts.iter().enumerate() {
        if path::is_within(&mount.prefix, vpath) {
            let len = mount.prefix.len();
            if best.map(|(_, l)| len > l).unwrap_or(true) {
                best = Some((idx, len));
            }
        }
    }
    best.map(|(idx, len)| {
        let rest = if vpath.len() == len {
            "/".to_owned()
        } else {
            vpath[len..].to_owned()
        };
        (idx, rest)
    })
}
