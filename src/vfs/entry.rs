use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Kind of a filesystem entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// A directory.
    Directory,
    /// A regular file.
    File,
    /// A symbolic link.
    Symlink,
}

/// Metadata common to every entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Entry id, unique within one filesystem instance.
    pub id: u32,
    /// Entry name within its parent directory.
    pub name: String,
    /// Entry kind.
    pub file_type: FileType,
    /// Payload size in bytes (files), target length (symlinks), 0 for
    /// directories.
    pub size: u64,
    /// Creation time, unix seconds.
    pub created_at: u64,
    /// Last mutation time, unix seconds.
    pub modified_at: u64,
    /// Last access time, unix seconds.
    pub accessed_at: u64,
    /// Permission bits.
    pub mode: u32,
    /// Owning user.
    pub owner: String,
    /// Owning group.
    pub group: String,
}

impl Metadata {
    pub(crate) fn new(name: &str, file_type: FileType) -> Metadata {
        let now = unix_now();
        let mode = match file_type {
            FileType::Directory => 0o755,
            FileType::File => 0o644,
            FileType::Symlink => 0o777,
        };
        Metadata {
            id: 0,
            name: name.to_owned(),
            file_type,
            size: 0,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            mode,
            owner: "user".to_owned(),
            group: "user".to_owned(),
        }
    }

    /// Marks the entry as mutated now.
    pub(crate) fn touch(&mut self) {
        self.modified_at = unix_now();
    }
}

/// A directory entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Common metadata.
    pub metadata: Metadata,
    /// Id of the parent directory; 0 only for the root.
    pub parent_id: u32,
    /// Ids of the direct children.
    pub children: Vec<u32>,
}

/// A regular file entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Common metadata.
    pub metadata: Metadata,
    /// Id of the parent directory.
    pub parent_id: u32,
    /// Ordered payload chunk record ids.
    pub chunk_ids: Vec<u32>,
}

/// A symbolic link entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    /// Common metadata.
    pub metadata: Metadata,
    /// Id of the parent directory.
    pub parent_id: u32,
    /// Link target, stored verbatim.
    pub target: String,
}

/// One filesystem entry of any kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    /// A directory.
    Dir(DirEntry),
    /// A regular file.
    File(FileEntry),
    /// A symbolic link.
    Symlink(SymlinkEntry),
}

impl Entry {
    /// Common metadata of the entry.
    pub fn metadata(&self) -> &Metadata {
        match self {
            Entry::Dir(dir) => &dir.metadata,
            Entry::File(file) => &file.metadata,
            Entry::Symlink(link) => &link.metadata,
        }
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Entry::Dir(dir) => &mut dir.metadata,
            Entry::File(file) => &mut file.metadata,
            Entry::Symlink(link) => &mut link.metadata,
        }
    }

    /// Entry id.
    pub fn id(&self) -> u32 {
        self.metadata().id
    }

    /// Entry name.
    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Id of the parent directory.
    pub fn parent_id(&self) -> u32 {
        match self {
            Entry::Dir(dir) => dir.parent_id,
            Entry::File(file) => file.parent_id,
            Entry::Symlink(link) => link.parent_id,
        }
    }

    pub(crate) fn set_parent_id(&mut self, parent_id: u32) {
        match self {
            Entry::Dir(dir) => dir.parent_id = parent_id,
            Entry::File(file) => file.parent_id = parent_id,
            Entry::Symlink(link) => link.parent_id = parent_id,
        }
    }

    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.metadata().file_type == FileType::Directory
    }

    /// Whether this entry is a regular file.
    pub fn is_file(&self) -> bool {
        self.metadata().file_type == FileType::File
    }

    /// Whether this entry is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.metadata().file_type == FileType::Symlink
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Entry> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Current time as unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
