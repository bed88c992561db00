use std::io::SeekFrom;

use crate::{Result, StoreError};

use super::store::LogVfs;
use super::Vfs;

/// Access mode of an open file session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only.
    Read,
    /// Write only; the file is truncated on open.
    Write,
    /// Read and write.
    ReadWrite,
    /// Write only; every write lands at the end of the file.
    Append,
}

impl OpenMode {
    fn readable(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// One open session on a file.
///
/// The handle buffers the file image: reads and writes operate on the
/// buffer and a dirty buffer is committed when the handle is closed, so
/// with concurrent sessions on one file the last writer wins. Operations
/// on a closed handle fail with `InvalidArgument`.
pub struct FileHandle {
    vfs: LogVfs,
    path: String,
    mode: OpenMode,
    buf: Vec<u8>,
    cursor: usize,
    dirty: bool,
    closed: bool,
}

impl LogVfs {
    /// Opens a session on the file at `path`. The file must exist;
    /// `OpenMode::Write` empties it immediately.
    pub fn open_file(&self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let entry = self.get(path)?;
        if !entry.is_file() {
            return Err(StoreError::NotFile(path.to_owned()));
        }

        let buf = match mode {
            OpenMode::Write => {
                self.file_write(path, &[])?;
                Vec::new()
            }
            _ => self.file_read(path)?,
        };
        let cursor = match mode {
            OpenMode::Append => buf.len(),
            _ => 0,
        };

        Ok(FileHandle {
            vfs: self.clone(),
            path: path.to_owned(),
            mode,
            buf,
            cursor,
            dirty: false,
            closed: false,
        })
    }
}

impl FileHandle {
    /// Mode this handle was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Current size of the buffered file image.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffered file image is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reads from the current cursor into `out`, returning the number of
    /// bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if !self.mode.readable() {
            return Err(StoreError::InvalidArgument(format!(
                "file {:?} is not open for reading",
                self.path
            )));
        }
        let available = self.buf.len().saturating_sub(self.cursor);
        let n = available.min(out.len());
        out[..n].copy_from_slice(&self.buf[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    /// Writes at the current cursor (at the end in `Append` mode),
    /// growing the file as needed. Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        if !self.mode.writable() {
            return Err(StoreError::InvalidArgument(format!(
                "file {:?} is not open for writing",
                self.path
            )));
        }
        if self.mode == OpenMode::Append {
            self.cursor = self.buf.len();
        }
        // A cursor past the end zero-fills the gap.
        if self.cursor > self.buf.len() {
            self.buf.resize(self.cursor, 0);
        }
        let end = self.cursor + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.cursor..end].copy_from_slice(data);
        self.cursor = end;
        self.dirty = true;
        Ok(data.len())
    }

    /// Moves the cursor and returns its new absolute position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open()?;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.buf.len() as i64 + offset,
            SeekFrom::Current(offset) => self.cursor as i64 + offset,
        };
        if target < 0 {
            return Err(StoreError::InvalidArgument(
                "cannot seek before the start of the file".to_owned(),
            ));
        }
        self.cursor = target as usize;
        Ok(self.cursor as u64)
    }

    /// Commits a dirty buffer and ends the session. Closing twice is a
    /// no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.dirty {
            self.vfs.file_write(&self.path, &self.buf)?;
            self.dirty = false;
        }
        self.closed = true;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::InvalidArgument(format!(
                "file {:?} is closed",
                self.path
            )));
        }
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed && self.dirty {
            if let Err(e) = self.close() {
                error!("failed to commit {:?} on drop: {}", self.path, e);
            }
        }
    }
}
