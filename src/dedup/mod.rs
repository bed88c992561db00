//! Content-addressed, reference-counted blob store.
//!
//! Blobs are identified by the lowercase hex SHA-256 of their bytes.
//! Storing bytes that are already present only registers another
//! reference; a blob disappears when its last reference is removed.
//!
//! Composition: blob bytes and per-blob metadata each live in their own
//! append-only log, a radix tree maps fingerprint → metadata id, and a
//! second radix tree maps blob id → fingerprint (the back-lookup used by
//! delete, kept outside the metadata record so its encoding stays fixed).

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::kvlog::{KeySize, KvLog, LogConfig};
use crate::radix::RadixTree;
use crate::{Result, StoreError};

mod meta;

pub use self::meta::Reference;

use self::meta::Metadata;

/// Largest accepted blob, in bytes.
pub const MAX_BLOB_SIZE: usize = 1024 * 1024;

/// Content-addressed blob store with reference counting.
///
/// Clones share the same store. Reads proceed in parallel; writes are
/// exclusive.
#[derive(Clone)]
pub struct DedupStore {
    path: Arc<PathBuf>,
    data: KvLog,
    meta: KvLog,
    hashes: RadixTree,
    ids: RadixTree,
    lock: Arc<RwLock<()>>,
}

impl DedupStore {
    /// Opens (or creates) a store rooted at `path`. With `reset` the
    /// existing contents are wiped first.
    pub fn open(path: impl Into<PathBuf>, reset: bool) -> Result<DedupStore> {
        let path = path.into();
        if reset && path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        // Blob payloads go up to MAX_BLOB_SIZE; everything else keeps the
        // compact record header.
        let mut data_config = LogConfig::new(path.join("data"));
        data_config.record_size_max = MAX_BLOB_SIZE as u32;
        data_config.file_size_max = 64 * 1024 * 1024;
        data_config.keysize = KeySize::Six;
        let data = KvLog::open(data_config)?;

        let meta = KvLog::open(LogConfig::new(path.join("meta")))?;
        let hashes = RadixTree::open(LogConfig::new(path.join("hashes")))?;
        let ids = RadixTree::open(LogConfig::new(path.join("ids")))?;

        Ok(DedupStore {
            path: Arc::new(path),
            data,
            meta,
            hashes,
            ids,
            lock: Arc::new(RwLock::new(())),
        })
    }

    /// Stores `data` on behalf of `reference` and returns the blob id.
    ///
    /// Identical bytes are stored once: repeat calls return the original
    /// id and at most register the new reference, so the call is
    /// idempotent per `(data, reference)` pair.
    pub fn store(&self, data: &[u8], reference: Reference) -> Result<u32> {
        if data.len() > MAX_BLOB_SIZE {
            return Err(StoreError::SizeExceeded(format!(
                "blob of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_BLOB_SIZE
            )));
        }
        let _guard = self.lock.write().unwrap();

        let fingerprint = hex::encode(Sha256::digest(data));
        if let Some(meta_id) = self.meta_id_for(&fingerprint)? {
            let mut metadata = Metadata::decode(&self.meta.get(meta_id)?)?;
            if metadata.add_reference(reference) {
                self.meta.set(Some(meta_id), &metadata.encode())?;
            }
            return Ok(metadata.id);
        }

        // New content. Blob bytes first, then the records that make them
        // reachable, so a crash can only leave an orphan blob behind.
        let blob_id = self.data.set(None, data)?;
        let metadata = Metadata {
            id: blob_id,
            references: vec![reference],
        };
        let meta_id = self.meta.set(None, &metadata.encode())?;
        self.hashes.set(&fingerprint, &meta_id.to_le_bytes())?;
        self.ids.set(&id_key(blob_id), fingerprint.as_bytes())?;
        Ok(blob_id)
    }

    /// Bytes of the blob stored under `id`.
    pub fn get(&self, id: u32) -> Result<Vec<u8>> {
        let _guard = self.lock.read().unwrap();
        self.data.get(id)
    }

    /// Whether a blob is stored under `id`. Lookup only.
    pub fn id_exists(&self, id: u32) -> bool {
        let _guard = self.lock.read().unwrap();
        self.data.exists(id)
    }

    /// Whether any stored blob has this lowercase hex SHA-256.
    pub fn hash_exists(&self, fingerprint: &str) -> bool {
        let _guard = self.lock.read().unwrap();
        self.hashes.get(fingerprint).is_ok()
    }

    /// Drops `reference`'s claim on blob `id`. Removing the last
    /// reference deletes the blob, its metadata and both index entries.
    pub fn delete(&self, id: u32, reference: Reference) -> Result<()> {
        let _guard = self.lock.write().unwrap();

        let fingerprint_raw = self.ids.get(&id_key(id))?;
        let fingerprint = String::from_utf8(fingerprint_raw)
            .map_err(|_| StoreError::Corrupt(format!("fingerprint for blob {} is not utf-8", id)))?;
        let meta_id = self.meta_id_for(&fingerprint)?.ok_or_else(|| {
            StoreError::Corrupt(format!("blob {} has no fingerprint index entry", id))
        })?;
        let mut metadata = Metadata::decode(&self.meta.get(meta_id)?)?;
        metadata.remove_reference(reference);

        if !metadata.references.is_empty() {
            self.meta.set(Some(meta_id), &metadata.encode())?;
            return Ok(());
        }

        // Last reference gone: tear down in reverse store order.
        self.ids.delete(&id_key(id))?;
        self.hashes.delete(&fingerprint)?;
        self.meta.delete(meta_id)?;
        self.data.delete(id)?;
        Ok(())
    }

    /// Flushes pending writes and snapshots every component's lookup.
    pub fn save(&self) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        self.data.save()?;
        self.meta.save()?;
        self.hashes.save()?;
        self.ids.save()
    }

    /// Flushes and snapshots; the store stays usable.
    pub fn close(&self) -> Result<()> {
        self.save()
    }

    /// Removes the store directory and everything in it.
    pub fn destroy(&self) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        self.data.destroy()?;
        self.meta.destroy()?;
        self.hashes.destroy()?;
        self.ids.destroy()?;
        fs::remove_dir_all(&*self.path)?;
        Ok(())
    }

    /// Metadata record id for `fingerprint`, if the content is present.
    fn meta_id_for(&self, fingerprint: &str) -> Result<Option<u32>> {
        let raw = match self.hashes.get(fingerprint) {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if raw.len() != 4 {
            return Err(StoreError::Corrupt(format!(
                "fingerprint {} maps to a malformed metadata id",
                fingerprint
            )));
        }
        Ok(Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
    }
}

/// Radix key for the blob id → fingerprint back-lookup tree.
fn id_key(id: u32) -> String {
    id.to_string()
}
