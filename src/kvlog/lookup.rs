use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::{Result, StoreError};

/// Magic prefix of a lookup snapshot file.
const DUMP_MAGIC: &[u8; 4] = b"kvlk";

/// Width of an encoded lookup key, fixed when a log store is created.
///
/// The keysize bounds the address range of the store: everything below
/// `Six` can only address records inside data file 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySize {
    /// 2-byte keys; positions up to `0xFFFF`, single data file.
    Two,
    /// 3-byte keys; positions up to `0xFF_FFFF`, single data file.
    Three,
    /// 4-byte keys; positions up to `0xFFFF_FFFF`, single data file.
    Four,
    /// 6-byte keys; full `(file_nr, position)` addressing.
    Six,
}

impl KeySize {
    /// Number of bytes one encoded location occupies under this keysize.
    pub fn bytes(self) -> usize {
        match self {
            KeySize::Two => 2,
            KeySize::Three => 3,
            KeySize::Four => 4,
            KeySize::Six => 6,
        }
    }

    /// Largest position encodable under this keysize.
    fn max_position(self) -> u32 {
        match self {
            KeySize::Two => 0xFFFF,
            KeySize::Three => 0x00FF_FFFF,
            KeySize::Four | KeySize::Six => u32::max_value(),
        }
    }

    /// Whether locations in data files other than 0 can be encoded.
    pub fn allows_file_rotation(self) -> bool {
        self == KeySize::Six
    }

    fn from_byte(raw: u8) -> Result<KeySize> {
        match raw {
            2 => Ok(KeySize::Two),
            3 => Ok(KeySize::Three),
            4 => Ok(KeySize::Four),
            6 => Ok(KeySize::Six),
            other => Err(StoreError::InvalidArgument(format!(
                "unsupported keysize {}",
                other
            ))),
        }
    }

    /// Checks that `location` is addressable under this keysize.
    pub(crate) fn check(self, location: Location) -> Result<()> {
        if location.file_nr != 0 && !self.allows_file_rotation() {
            return Err(StoreError::SizeExceeded(format!(
                "file_nr {} not addressable with a {}-byte keysize",
                location.file_nr,
                self.bytes()
            )));
        }
        if location.position > self.max_position() {
            return Err(StoreError::SizeExceeded(format!(
                "position {} exceeds the {}-byte keysize range",
                location.position,
                self.bytes()
            )));
        }
        Ok(())
    }
}

/// Physical address of a record: data file number and the byte offset of
/// the record header inside that file.
///
/// The all-zero location is the null sentinel; data files start with a
/// magic preamble so no record header ever sits at offset 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Location {
    /// Data file number.
    pub file_nr: u16,
    /// Byte offset of the record header inside the data file.
    pub position: u32,
}

impl Location {
    /// Whether this is the null sentinel.
    pub fn is_null(self) -> bool {
        self.file_nr == 0 && self.position == 0
    }

    /// Full 6-byte form: `file_nr` (LE 2B) followed by `position` (LE 4B).
    pub fn to_bytes(self) -> [u8; 6] {
        let mut raw = [0u8; 6];
        raw[..2].copy_from_slice(&self.file_nr.to_le_bytes());
        raw[2..].copy_from_slice(&self.position.to_le_bytes());
        raw
    }

    /// Decodes the full 6-byte form.
    pub fn from_bytes(raw: &[u8]) -> Result<Location> {
        if raw.len() != 6 {
            return Err(StoreError::Corrupt(format!(
                "location must be 6 bytes, got {}",
                raw.len()
            )));
        }
        Ok(Location {
            file_nr: u16::from_le_bytes([raw[0], raw[1]]),
            position: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
        })
    }

    /// Encodes into the lookup key form selected by `keysize`.
    pub fn encode(self, keysize: KeySize) -> Result<Vec<u8>> {
        keysize.check(self)?;
        let pos = self.position.to_le_bytes();
        let raw = match keysize {
            KeySize::Two => pos[..2].to_vec(),
            KeySize::Three => pos[..3].to_vec(),
            KeySize::Four => pos.to_vec(),
            KeySize::Six => self.to_bytes().to_vec(),
        };
        Ok(raw)
    }

    /// Decodes a lookup key; the keysize is implied by the length.
    pub fn decode(raw: &[u8]) -> Result<Location> {
        match raw.len() {
            2 | 3 | 4 => {
                let mut pos = [0u8; 4];
                pos[..raw.len()].copy_from_slice(raw);
                Ok(Location {
                    file_nr: 0,
                    position: u32::from_le_bytes(pos),
                })
            }
            6 => Location::from_bytes(raw),
            n => Err(StoreError::Corrupt(format!(
                "cannot decode a {}-byte location key",
                n
            ))),
        }
    }
}

/// Sparse id → location table.
///
/// Readers traverse the skip list lock-free while the single log writer
/// mutates it; the non-empty region can be snapshotted to a sidecar file
/// and restored on open.
pub struct Lookup {
    keysize: KeySize,
    map: SkipMap<u32, Location>,
    /// Lower bound on the lowest free id; keeps allocation from
    /// rescanning the whole occupied range.
    free_hint: AtomicU32,
}

impl Lookup {
    pub(crate) fn new(keysize: KeySize) -> Lookup {
        Lookup {
            keysize,
            map: SkipMap::new(),
            free_hint: AtomicU32::new(1),
        }
    }

    /// Location of `id`, if the slot is occupied.
    pub fn get(&self, id: u32) -> Option<Location> {
        self.map.get(&id).map(|entry| *entry.value())
    }

    /// Whether the slot for `id` is occupied.
    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    /// Points `id` at `location`, validating it against the keysize range.
    pub fn set(&self, id: u32, location: Location) -> Result<()> {
        self.keysize.check(location)?;
        self.map.insert(id, location);
        let _ = self
            .free_hint
            .compare_exchange(id, id + 1, Ordering::Relaxed, Ordering::Relaxed);
        Ok(())
    }

    /// Frees the slot for `id`.
    pub fn delete(&self, id: u32) {
        self.map.remove(&id);
        self.free_hint.fetch_min(id, Ordering::Relaxed);
    }

    /// Lowest free slot; ids are 1-based and deleted slots are reused.
    pub fn next_id(&self) -> u32 {
        let mut next = self.free_hint.load(Ordering::Relaxed).max(1);
        for entry in self.map.range(next..) {
            let id = *entry.key();
            if id == next {
                next += 1;
            } else {
                break;
            }
        }
        next
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Writes the non-empty region to `path`.
    ///
    /// Format: `"kvlk" ‖ keysize(1B) ‖ count(LE 4B) ‖ {id(LE 4B) ‖ key}*`
    /// where `key` is the keysize-encoded location. The snapshot is written
    /// to a sidecar temp file first and moved into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(DUMP_MAGIC)?;
            writer.write_all(&[self.keysize.bytes() as u8])?;
            writer.write_all(&(self.map.len() as u32).to_le_bytes())?;
            for entry in self.map.iter() {
                writer.write_all(&entry.key().to_le_bytes())?;
                writer.write_all(&entry.value().encode(self.keysize)?)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Restores the table from a snapshot written by [`Lookup::save`].
    ///
    /// A missing snapshot file is a no-op; a snapshot written under a
    /// different keysize fails with `InvalidArgument`.
    pub fn load(&self, path: &Path) -> Result<()> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        if raw.len() < 9 || &raw[..4] != DUMP_MAGIC {
            return Err(StoreError::Corrupt(format!(
                "bad lookup snapshot at {:?}",
                path
            )));
        }
        let keysize = KeySize::from_byte(raw[4])?;
        if keysize != self.keysize {
            return Err(StoreError::InvalidArgument(format!(
                "snapshot keysize {} does not match store keysize {}",
                keysize.bytes(),
                self.keysize.bytes()
            )));
        }
        let count = u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]) as usize;
        let stride = 4 + keysize.bytes();
        if raw.len() != 9 + count * stride {
            return Err(StoreError::Corrupt(format!(
                "lookup snapshot at {:?} is truncated",
                path
            )));
        }

        for chunk in raw[9..].chunks(stride) {
            let id = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let location = Location::decode(&chunk[4..])?;
            self.map.insert(id, location);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_roundtrip_all_keysizes() {
        let loc = Location {
            file_nr: 0,
            position: 0xABCD,
        };
        for &keysize in &[KeySize::Two, KeySize::Three, KeySize::Four, KeySize::Six] {
            let raw = loc.encode(keysize).unwrap();
            assert_eq!(raw.len(), keysize.bytes());
            assert_eq!(Location::decode(&raw).unwrap(), loc);
        }
    }

    #[test]
    fn small_keysize_rejects_file_nr() {
        let loc = Location {
            file_nr: 3,
            position: 10,
        };
        assert!(loc.encode(KeySize::Four).is_err());
        assert!(loc.encode(KeySize::Six).is_ok());
    }

    #[test]
    fn small_keysize_rejects_large_position() {
        let loc = Location {
            file_nr: 0,
            position: 0x1_0000,
        };
        assert!(loc.encode(KeySize::Two).is_err());
        assert!(loc.encode(KeySize::Three).is_ok());
    }

    #[test]
    fn next_id_fills_gaps() {
        let lookup = Lookup::new(KeySize::Four);
        let loc = Location {
            file_nr: 0,
            position: 4,
        };
        assert_eq!(lookup.next_id(), 1);
        lookup.set(1, loc).unwrap();
        lookup.set(2, loc).unwrap();
        lookup.set(4, loc).unwrap();
        assert_eq!(lookup.next_id(), 3);
        lookup.delete(1);
        assert_eq!(lookup.next_id(), 1);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookup_dump.db");

        let lookup = Lookup::new(KeySize::Six);
        for id in [1u32, 7, 300].iter() {
            lookup
                .set(
                    *id,
                    Location {
                        file_nr: (*id % 2) as u16,
                        position: id * 100,
                    },
                )
                .unwrap();
        }
        lookup.save(&path).unwrap();

        let restored = Lookup::new(KeySize::Six);
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(
            restored.get(300),
            Some(Location {
                file_nr: 0,
                position: 30000
            })
        );
    }

    #[test]
    fn load_missing_snapshot_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = Lookup::new(KeySize::Four);
        lookup.load(&dir.path().join("absent.db")).unwrap();
        assert!(lookup.is_empty());
    }
}
