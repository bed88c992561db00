//! Hierarchical virtual filesystem.
//!
//! The [`Vfs`] trait is the contract protocol front-ends consume: they
//! hold an abstract reference and never look behind it. Three
//! implementations are provided: [`LogVfs`] persists everything through
//! append-only record logs, [`LocalVfs`] maps the contract onto a host
//! directory, and [`NestedVfs`] composes other filesystems under path
//! prefixes.
//!
//! Paths are absolute and '/'-separated; `.` and `..` are rejected, so
//! front-ends resolve those before calling in.

use crate::Result;

mod entry;
mod handle;
mod local;
mod nested;
mod path;
mod store;

pub use self::entry::{DirEntry, Entry, FileEntry, FileType, Metadata, SymlinkEntry};
pub use self::handle::{FileHandle, OpenMode};
pub use self::local::LocalVfs;
pub use self::nested::NestedVfs;
pub use self::store::LogVfs;

/// Filesystem contract.
///
/// Every operation takes an absolute path. Errors come back by kind:
/// `NotFound` for missing paths, `AlreadyExists` for create or rename
/// collisions, `NotDirectory`/`NotFile`/`NotSymlink` for kind mismatches
/// and `InvalidArgument` for malformed paths.
pub trait Vfs: Send + Sync {
    /// The root directory entry.
    fn root_get(&self) -> Result<Entry>;

    /// The entry at `path`.
    fn get(&self, path: &str) -> Result<Entry>;

    /// Whether an entry exists at `path`.
    fn exists(&self, path: &str) -> bool;

    /// Absolute path of `entry`.
    fn get_path(&self, entry: &Entry) -> Result<String>;

    /// Creates an empty file. The parent directory must exist; an
    /// existing entry at `path` is a conflict.
    fn file_create(&self, path: &str) -> Result<Entry>;

    /// Whole payload of the file at `path`.
    fn file_read(&self, path: &str) -> Result<Vec<u8>>;

    /// Replaces the payload of the file at `path`.
    fn file_write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Appends to the payload of the file at `path`.
    fn file_concatenate(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Deletes the file at `path`.
    fn file_delete(&self, path: &str) -> Result<()>;

    /// Creates a directory, along with any missing intermediate
    /// directories. Creating an existing directory is a no-op.
    fn dir_create(&self, path: &str) -> Result<Entry>;

    /// Entries of the directory at `path`.
    fn dir_list(&self, path: &str) -> Result<Vec<Entry>>;

    /// Recursively deletes the directory at `path`.
    fn dir_delete(&self, path: &str) -> Result<()>;

    /// Creates a symlink at `link_path` pointing at `target`.
    fn link_create(&self, target: &str, link_path: &str) -> Result<Entry>;

    /// Target of the symlink at `path`.
    fn link_read(&self, path: &str) -> Result<String>;

    /// Deletes the symlink at `path`.
    fn link_delete(&self, path: &str) -> Result<()>;

    /// Moves the entry at `old_path` to `new_path` without re-creating
    /// it: ids are preserved and only the two parents and the entry
    /// itself change.
    fn rename(&self, old_path: &str, new_path: &str) -> Result<Entry>;

    /// Deep-copies the entry at `src` to `dst`, allocating new ids.
    /// Directories copy recursively; symlink targets copy verbatim.
    fn copy(&self, src: &str, dst: &str) -> Result<Entry>;

    /// Moves the entry at `src` to `dst`. Within one filesystem this is
    /// a rename.
    fn move_entry(&self, src: &str, dst: &str) -> Result<Entry>;

    /// Deletes the entry at `path`, dispatching on its kind.
    fn delete(&self, path: &str) -> Result<()>;

    /// Removes all stored state from disk.
    fn destroy(&self) -> Result<()>;
}

/// Deep copy of a subtree across (possibly different) filesystems, going
/// through the contract only.
pub fn copy_tree(src: &dyn Vfs, src_path: &str, dst: &dyn Vfs, dst_path: &str) -> Result<()> {
    let entry = src.get(src_path)?;
    if entry.is_dir() {
        dst.dir_create(dst_path)?;
        for child in src.dir_list(src_path)? {
            copy_tree(
                src,
                &path::join(src_path, child.name()),
                dst,
                &path::join(dst_path, child.name()),
            )?;
        }
    } else if entry.is_file() {
        let data = src.file_read(src_path)?;
        dst.file_create(dst_path)?;
        dst.file_write(dst_path, &data)?;
    } else {
        let target = src.link_read(src_path)?;
        dst.link_create(&target, dst_path)?;
    }
    Ok(())
}
