//! Append-only keyed record log.
//!
//! Records live in rotating append-only data files; a sparse in-memory
//! lookup table maps each id to the `(file_nr, position)` of its newest
//! record. Every record header carries a back-pointer to the previous
//! version of the same id, which makes per-id history a sequence of O(1)
//! hops. Integrity is per record: a CRC32 over the back-pointer and the
//! payload.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher;

use crate::{Result, StoreError};

mod lookup;

pub use self::lookup::{KeySize, Location, Lookup};

/// Name of the lookup snapshot sidecar file.
const LOOKUP_DUMP: &str = "lookup_dump.db";

/// Preamble written at the start of every data file, so that no record
/// header ever sits at offset 0 (the null back-pointer sentinel).
const FILE_MAGIC: &[u8; 4] = b"KVL1";

/// Configuration for opening a [`KvLog`].
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Directory holding the data files and the lookup snapshot.
    pub path: PathBuf,
    /// Wipe the directory before opening.
    pub reset: bool,
    /// Auto-increment mode: ids are allocated by the log and `set` with an
    /// explicit id only rewrites existing slots. When false the caller
    /// owns the id space.
    pub incremental_mode: bool,
    /// Largest accepted payload, in bytes. Values above 65535 widen the
    /// record length field from 2 to 4 bytes.
    pub record_size_max: u32,
    /// Data file rotation threshold, in bytes.
    pub file_size_max: u32,
    /// Lookup key width; bounds the store's address range.
    pub keysize: KeySize,
}

impl LogConfig {
    /// Default configuration rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> LogConfig {
        LogConfig {
            path: path.into(),
            reset: false,
            incremental_mode: true,
            record_size_max: u16::max_value() as u32,
            file_size_max: 32 * 1024 * 1024,
            keysize: KeySize::Four,
        }
    }
}

/// Shared, immutable once opened.
struct LogOpts {
    incremental: bool,
    record_size_max: u32,
    file_size_max: u64,
    keysize: KeySize,
    /// Width of the record length field: 2 bytes for payloads ≤ 65535,
    /// 4 bytes for larger `record_size_max` configurations.
    len_width: usize,
}

impl LogOpts {
    fn header_bytes(&self) -> usize {
        // crc32 + prev location + length field
        4 + 6 + self.len_width
    }
}

/// The append-only keyed record log.
///
/// Cloning is cheap and clones share the same store. The writer is behind
/// a mutex; each clone keeps its own cache of read handles, so readers in
/// different threads proceed in parallel.
#[derive(Clone)]
pub struct KvLog {
    path: Arc<PathBuf>,
    opts: Arc<LogOpts>,
    lookup: Arc<Lookup>,
    reader: LogReader,
    writer: Arc<Mutex<LogWriter>>,
}

impl KvLog {
    /// Opens the store described by `config`, creating the directory if it
    /// does not exist. A lookup snapshot left by [`KvLog::save`] or
    /// [`KvLog::close`] is restored; without one the store starts empty.
    pub fn open(config: LogConfig) -> Result<KvLog> {
        if config.record_size_max == 0 {
            return Err(StoreError::InvalidArgument(
                "record_size_max must be nonzero".to_owned(),
            ));
        }
        let len_width = if config.record_size_max > u16::max_value() as u32 {
            4
        } else {
            2
        };
        let opts = Arc::new(LogOpts {
            incremental: config.incremental_mode,
            record_size_max: config.record_size_max,
            file_size_max: config.file_size_max as u64,
            keysize: config.keysize,
            len_width,
        });
        if (opts.header_bytes() + config.record_size_max as usize + FILE_MAGIC.len()) as u64
            > opts.file_size_max
        {
            return Err(StoreError::InvalidArgument(format!(
                "file_size_max {} cannot hold a maximum-size record",
                config.file_size_max
            )));
        }

        if config.reset && config.path.exists() {
            fs::remove_dir_all(&config.path)?;
        }
        fs::create_dir_all(&config.path)?;
        let path = Arc::new(config.path);

        let lookup = Arc::new(Lookup::new(config.keysize));
        lookup.load(&path.join(LOOKUP_DUMP))?;

        // Append to the newest data file, or start file 0.
        let file_list = sorted_file_list(&path)?;
        let current_nr = file_list.last().cloned().unwrap_or(0);
        let writer = LogWriter::open(Arc::clone(&path), Arc::clone(&opts), current_nr)?;
        debug!(
            "opened log store at {:?}: {} ids, {} data file(s)",
            path,
            lookup.len(),
            file_list.len().max(1)
        );

        Ok(KvLog {
            reader: LogReader::new(Arc::clone(&path), Arc::clone(&opts)),
            writer: Arc::new(Mutex::new(writer)),
            path,
            opts,
            lookup,
        })
    }

    /// Writes a record and returns its id.
    ///
    /// In incremental mode a `None` id allocates the lowest free slot and
    /// an explicit id must name an occupied slot. In key-value mode the id
    /// is required and the caller owns the id space. Rewriting an occupied
    /// slot chains the new record to the previous version.
    pub fn set(&self, id: Option<u32>, data: &[u8]) -> Result<u32> {
        if data.len() as u64 > self.opts.record_size_max as u64 {
            return Err(StoreError::SizeExceeded(format!(
                "record of {} bytes exceeds record_size_max {}",
                data.len(),
                self.opts.record_size_max
            )));
        }

        let mut writer = self.writer.lock().unwrap();
        let id = match (self.opts.incremental, id) {
            (true, None) => self.lookup.next_id(),
            (true, Some(id)) => {
                if !self.lookup.contains(id) {
                    return Err(StoreError::InvalidArgument(format!(
                        "id {} is not assigned; omit the id to allocate one",
                        id
                    )));
                }
                id
            }
            (false, Some(id)) => id,
            (false, None) => {
                return Err(StoreError::InvalidArgument(
                    "an id is required in key-value mode".to_owned(),
                ));
            }
        };

        let prev = self.lookup.get(id).unwrap_or_default();
        let location = writer.append(prev, data)?;
        self.lookup.set(id, location)?;
        Ok(id)
    }

    /// Newest payload stored under `id`.
    pub fn get(&self, id: u32) -> Result<Vec<u8>> {
        let location = self
            .lookup
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("id {}", id)))?;
        Ok(self.reader.read_record(location)?.payload)
    }

    /// Whether `id` currently names a record. Lookup only, no disk access.
    pub fn exists(&self, id: u32) -> bool {
        self.lookup.contains(id)
    }

    /// Up to `depth` payloads for `id`, newest first, following the
    /// back-pointer chain. The walk stops early at a null back-pointer or
    /// at the first unreadable record.
    pub fn get_history(&self, id: u32, depth: usize) -> Result<Vec<Vec<u8>>> {
        let head = self
            .lookup
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("id {}", id)))?;

        let mut history = Vec::new();
        let mut next = head;
        while history.len() < depth {
            let record = match self.reader.read_record(next) {
                Ok(record) => record,
                Err(_) => break,
            };
            history.push(record.payload);
            if record.prev.is_null() {
                break;
            }
            next = record.prev;
        }
        Ok(history)
    }

    /// Deletes `id`: zeroes the on-disk header of its newest record and
    /// frees the slot. Older versions stay on disk but become unreachable;
    /// space reclamation is deferred.
    pub fn delete(&self, id: u32) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        let location = self
            .lookup
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("id {}", id)))?;
        writer.zero_header(location)?;
        self.lookup.delete(id);
        Ok(())
    }

    /// Lowest free id. Only meaningful in incremental mode.
    pub fn get_next_id(&self) -> Result<u32> {
        if !self.opts.incremental {
            return Err(StoreError::InvalidArgument(
                "get_next_id is only available in incremental mode".to_owned(),
            ));
        }
        let _writer = self.writer.lock().unwrap();
        Ok(self.lookup.next_id())
    }

    /// Flushes pending writes and snapshots the lookup table.
    pub fn save(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush()?;
        self.lookup.save(&self.path.join(LOOKUP_DUMP))
    }

    /// Re-reads the lookup snapshot from disk. A missing snapshot is a
    /// no-op.
    pub fn load(&self) -> Result<()> {
        let _writer = self.writer.lock().unwrap();
        self.lookup.load(&self.path.join(LOOKUP_DUMP))
    }

    /// Flushes and snapshots; the store stays usable.
    pub fn close(&self) -> Result<()> {
        self.save()
    }

    /// Removes the store directory and everything in it.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock().unwrap();
            if let Err(e) = writer.flush() {
                error!("flush before destroy failed: {}", e);
            }
        }
        fs::remove_dir_all(&*self.path)?;
        Ok(())
    }

    /// Directory holding this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of occupied id slots.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// One decoded record.
struct Record {
    payload: Vec<u8>,
    prev: Location,
}

/// Read side of the store.
///
/// Each clone keeps its own file handles, so `KvLog` clones in different
/// threads read in parallel.
struct LogReader {
    path: Arc<PathBuf>,
    opts: Arc<LogOpts>,
    readers: Mutex<BTreeMap<u16, BufReaderWithPos<File>>>,
}

impl Clone for LogReader {
    fn clone(&self) -> Self {
        LogReader {
            path: Arc::clone(&self.path),
            opts: Arc::clone(&self.opts),
            // Don't share file handles with the source reader.
            readers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl LogReader {
    fn new(path: Arc<PathBuf>, opts: Arc<LogOpts>) -> LogReader {
        LogReader {
            path,
            opts,
            readers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reads and verifies the record whose header starts at `location`.
    fn read_record(&self, location: Location) -> Result<Record> {
        let mut readers = self.readers.lock().unwrap();

        // Open the data file on first use. A lookup entry pointing at a
        // file that does not exist is an internal inconsistency.
        if !readers.contains_key(&location.file_nr) {
            let file = File::open(data_file_path(&self.path, location.file_nr)).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    StoreError::Corrupt(format!("data file {} is missing", location.file_nr))
                } else {
                    StoreError::Io(e)
                }
            })?;
            readers.insert(location.file_nr, BufReaderWithPos::new(file)?);
        }
        let reader = readers
            .get_mut(&location.file_nr)
            .expect("reader was just inserted");

        reader.seek(SeekFrom::Start(location.position as u64))?;
        let header_bytes = self.opts.header_bytes();
        let mut header = vec![0u8; header_bytes];
        reader
            .read_exact(&mut header)
            .map_err(|e| truncated(e, location))?;

        if header.iter().all(|&b| b == 0) {
            return Err(StoreError::Corrupt(format!(
                "record at {:?} was deleted",
                location
            )));
        }

        let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let prev = Location::from_bytes(&header[4..10])?;
        let len = match self.opts.len_width {
            2 => u16::from_le_bytes([header[10], header[11]]) as usize,
            _ => u32::from_le_bytes([header[10], header[11], header[12], header[13]]) as usize,
        };
        if len as u64 > self.opts.record_size_max as u64 {
            return Err(StoreError::Corrupt(format!(
                "record at {:?} claims {} bytes, above record_size_max",
                location, len
            )));
        }

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|e| truncated(e, location))?;

        let mut hasher = Hasher::new();
        hasher.update(&header[4..10]);
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(StoreError::Corrupt(format!(
                "crc mismatch for record at {:?}",
                location
            )));
        }

        Ok(Record { payload, prev })
    }
}

fn truncated(e: io::Error, location: Location) -> StoreError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        StoreError::Corrupt(format!("truncated record at {:?}", location))
    } else {
        StoreError::Io(e)
    }
}

/// Write side of the store; exactly one exists per store.
struct LogWriter {
    path: Arc<PathBuf>,
    opts: Arc<LogOpts>,
    writer: BufWriterWithPos<File>,
    file_nr: u16,
}

impl LogWriter {
    /// Opens data file `file_nr` for appending, creating it (with its
    /// preamble) if absent.
    fn open(path: Arc<PathBuf>, opts: Arc<LogOpts>, file_nr: u16) -> Result<LogWriter> {
        let file_path = data_file_path(&path, file_nr);
        let fresh = !file_path.exists();
        let mut writer = BufWriterWithPos::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)?,
        )?;
        if fresh {
            writer.write_all(FILE_MAGIC)?;
            writer.flush()?;
        }
        Ok(LogWriter {
            path,
            opts,
            writer,
            file_nr,
        })
    }

    /// Appends one record and returns where its header landed.
    fn append(&mut self, prev: Location, payload: &[u8]) -> Result<Location> {
        let needed = (self.opts.header_bytes() + payload.len()) as u64;
        if self.writer.pos + needed > self.opts.file_size_max
            && self.opts.keysize.allows_file_rotation()
        {
            self.rotate()?;
        }

        if self.writer.pos > u32::max_value() as u64 {
            return Err(StoreError::SizeExceeded(
                "data file exceeds the 32-bit position range".to_owned(),
            ));
        }
        let location = Location {
            file_nr: self.file_nr,
            position: self.writer.pos as u32,
        };
        // Fail before writing anything if the keysize cannot address it.
        self.opts.keysize.check(location)?;

        let prev_bytes = prev.to_bytes();
        let mut hasher = Hasher::new();
        hasher.update(&prev_bytes);
        hasher.update(payload);

        self.writer.write_all(&hasher.finalize().to_le_bytes())?;
        self.writer.write_all(&prev_bytes)?;
        match self.opts.len_width {
            2 => self.writer.write_all(&(payload.len() as u16).to_le_bytes())?,
            _ => self.writer.write_all(&(payload.len() as u32).to_le_bytes())?,
        }
        self.writer.write_all(payload)?;
        self.writer.flush()?;

        Ok(location)
    }

    /// Moves the writer to the next data file.
    fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let next = self.file_nr.checked_add(1).ok_or_else(|| {
            StoreError::SizeExceeded("data file number space exhausted".to_owned())
        })?;
        let replacement = LogWriter::open(Arc::clone(&self.path), Arc::clone(&self.opts), next)?;
        self.writer = replacement.writer;
        self.file_nr = next;
        debug!("rotated to data file {}", next);
        Ok(())
    }

    /// Tombstones the record at `location` by zeroing its header in place.
    fn zero_header(&mut self, location: Location) -> Result<()> {
        self.writer.flush()?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(data_file_path(&self.path, location.file_nr))?;
        file.seek(SeekFrom::Start(location.position as u64))?;
        file.write_all(&vec![0u8; self.opts.header_bytes()])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn data_file_path(dir: &Path, file_nr: u16) -> PathBuf {
    dir.join(format!("{}.log", file_nr))
}

/// Returns sorted data file numbers in the given directory.
fn sorted_file_list(path: &Path) -> Result<Vec<u16>> {
    let mut file_list: Vec<u16> = fs::read_dir(&path)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.is_file() && path.extension() == Some("log".as_ref()))
        .flat_map(|path| {
            path.file_name()
                .and_then(OsStr::to_str)
                .map(|s| s.trim_end_matches(".log"))
                .map(str::parse::<u16>)
        })
        .flatten()
        .collect();

    file_list.sort_unstable();
    Ok(file_list)
}

/// A wrapper of BufReader of a data file
struct BufReaderWithPos<R: Read + Seek> {
    reader: BufReader<R>,
    pos: u64,
}

impl<R: Read + Seek> BufReaderWithPos<R> {
    fn new(mut inner: R) -> Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(BufReaderWithPos {
            reader: BufReader::new(inner),
            pos,
        })
    }
}

impl<R: Read + Seek> Read for BufReaderWithPos<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;

        Ok(len)
    }
}

impl<R: Read + Seek> Seek for BufReaderWithPos<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

/// A wrapper of BufWriter of a data file
struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write + Seek> Seek for BufWriterWithPos<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.writer.seek(pos)?;
        Ok(self.pos)
    }
}
