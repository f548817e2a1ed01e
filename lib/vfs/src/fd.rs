use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{FsError, Result};
use crate::filesystem::FileSystem;

/// Reserved descriptor for the socket-shim control channel. The
/// allocator never hands it out.
pub const CONTROL_FD: u32 = 1023;

/// First descriptor available to `open`; 0-2 are the stdio streams and
/// are not tracked here.
pub const FIRST_FD: u32 = 3;

/// How a descriptor was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
    ReadWrite,
}

impl OpenMode {
    pub fn readable(&self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// Open-file state. The buffer is a snapshot of the file taken at open
/// time; `dup`ed descriptors alias it, independent tables deep-copy it.
#[derive(Debug, Clone)]
struct FdEntry {
    path: String,
    mode: OpenMode,
    buffer: Arc<RwLock<Vec<u8>>>,
    offset: usize,
    dirty: bool,
}

/// Per-process descriptor table over a shared filesystem.
///
/// Opening snapshots the file bytes; concurrent writes through other
/// paths are not observed until re-open. Writable descriptors flush
/// their buffer back on `close`.
#[derive(Debug)]
pub struct FdTable {
    fs: Arc<dyn FileSystem>,
    entries: BTreeMap<u32, FdEntry>,
}

impl FdTable {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        FdTable {
            fs,
            entries: BTreeMap::new(),
        }
    }

    fn allocate(&self) -> u32 {
        let mut fd = FIRST_FD;
        while self.entries.contains_key(&fd) || fd == CONTROL_FD {
            fd += 1;
        }
        fd
    }

    /// Mark a descriptor as in use without backing it by a file, so the
    /// allocator steps over it. Used for the WASI preopen slot.
    pub fn reserve(&mut self, fd: u32, path: &str) -> Result<()> {
        if self.entries.contains_key(&fd) {
            return Err(FsError::AlreadyExists);
        }
        self.entries.insert(
            fd,
            FdEntry {
                path: path.to_string(),
                mode: OpenMode::Read,
                buffer: Arc::new(RwLock::new(Vec::new())),
                offset: 0,
                dirty: false,
            },
        );
        Ok(())
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<u32> {
        let (buffer, offset, dirty) = match mode {
            OpenMode::Read | OpenMode::ReadWrite => {
                let data = self.fs.read_file(path)?;
                (data, 0, false)
            }
            OpenMode::Write => (Vec::new(), 0, true),
            OpenMode::Append => {
                let data = match self.fs.read_file(path) {
                    Ok(bytes) => bytes,
                    Err(FsError::EntryNotFound) => Vec::new(),
                    Err(err) => return Err(err),
                };
                let len = data.len();
                (data, len, true)
            }
        };
        let fd = self.allocate();
        self.entries.insert(
            fd,
            FdEntry {
                path: path.to_string(),
                mode,
                buffer: Arc::new(RwLock::new(buffer)),
                offset,
                dirty,
            },
        );
        Ok(fd)
    }

    pub fn close(&mut self, fd: u32) -> Result<()> {
        let entry = self.entries.remove(&fd).ok_or(FsError::InvalidFd)?;
        if entry.dirty && entry.mode.writable() {
            let data = entry.buffer.read().clone();
            self.fs.write_file(&entry.path, &data)?;
        }
        Ok(())
    }

    pub fn read(&mut self, fd: u32, buf: &mut [u8]) -> Result<usize> {
        let entry = self.entries.get_mut(&fd).ok_or(FsError::InvalidFd)?;
        if !entry.mode.readable() {
            return Err(FsError::InvalidFd);
        }
        let data = entry.buffer.read();
        if entry.offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - entry.offset);
        buf[..n].copy_from_slice(&data[entry.offset..entry.offset + n]);
        drop(data);
        entry.offset += n;
        Ok(n)
    }

    pub fn write(&mut self, fd: u32, data: &[u8]) -> Result<usize> {
        let entry = self.entries.get_mut(&fd).ok_or(FsError::InvalidFd)?;
        if !entry.mode.writable() {
            return Err(FsError::InvalidFd);
        }
        let mut buffer = entry.buffer.write();
        let end = entry.offset + data.len();
        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[entry.offset..end].copy_from_slice(data);
        drop(buffer);
        entry.offset = end;
        entry.dirty = true;
        Ok(data.len())
    }

    /// Seek with non-negative clamping; the resulting offset may point
    /// past the end of the buffer.
    pub fn seek(&mut self, fd: u32, pos: SeekFrom) -> Result<u64> {
        let entry = self.entries.get_mut(&fd).ok_or(FsError::InvalidFd)?;
        let len = entry.buffer.read().len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => entry.offset as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };
        entry.offset = target.max(0) as usize;
        Ok(entry.offset as u64)
    }

    pub fn set_len(&mut self, fd: u32, len: u64) -> Result<()> {
        let entry = self.entries.get_mut(&fd).ok_or(FsError::InvalidFd)?;
        if !entry.mode.writable() {
            return Err(FsError::InvalidFd);
        }
        entry.buffer.write().resize(len as usize, 0);
        entry.dirty = true;
        Ok(())
    }

    /// New descriptor aliasing the same buffer with an independent
    /// offset.
    pub fn dup(&mut self, fd: u32) -> Result<u32> {
        let entry = self.entries.get(&fd).ok_or(FsError::InvalidFd)?.clone();
        let new_fd = self.allocate();
        self.entries.insert(new_fd, entry);
        Ok(new_fd)
    }

    pub fn offset(&self, fd: u32) -> Result<u64> {
        Ok(self.entries.get(&fd).ok_or(FsError::InvalidFd)?.offset as u64)
    }

    pub fn size(&self, fd: u32) -> Result<u64> {
        Ok(self
            .entries
            .get(&fd)
            .ok_or(FsError::InvalidFd)?
            .buffer
            .read()
            .len() as u64)
    }

    pub fn path(&self, fd: u32) -> Result<&str> {
        Ok(&self.entries.get(&fd).ok_or(FsError::InvalidFd)?.path)
    }

    pub fn is_open(&self, fd: u32) -> bool {
        self.entries.contains_key(&fd)
    }

    /// Independent table for fork simulation: buffers are deep-copied so
    /// neither table observes the other's writes.
    pub fn fork(&self, fs: Arc<dyn FileSystem>) -> FdTable {
        let entries = self
            .entries
            .iter()
            .map(|(fd, entry)| {
                let copied = entry.buffer.read().clone();
                (
                    *fd,
                    FdEntry {
                        path: entry.path.clone(),
                        mode: entry.mode,
                        buffer: Arc::new(RwLock::new(copied)),
                        offset: entry.offset,
                        dirty: entry.dirty,
                    },
                )
            })
            .collect();
        FdTable { fs, entries }
    }

    /// Flush every dirty descriptor without closing it.
    pub fn flush_all(&mut self) -> Result<()> {
        for entry in self.entries.values_mut() {
            if entry.dirty && entry.mode.writable() {
                let data = entry.buffer.read().clone();
                self.fs.write_file(&entry.path, &data)?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn insert_placeholder(&mut self, fd: u32) {
        self.entries.insert(
            fd,
            FdEntry {
                path: String::new(),
                mode: OpenMode::Read,
                buffer: Arc::new(RwLock::new(Vec::new())),
                offset: 0,
                dirty: false,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Vfs;

    fn table() -> (Vfs, FdTable) {
        let vfs = Vfs::new();
        let fdt = FdTable::new(Arc::new(vfs.clone()));
        (vfs, fdt)
    }

    #[test]
    fn read_requires_existing_file() {
        let (_vfs, mut fdt) = table();
        assert_eq!(
            fdt.open("/home/user/missing", OpenMode::Read),
            Err(FsError::EntryNotFound)
        );
    }

    #[test]
    fn write_truncates_and_flushes_on_close() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"old contents").unwrap();
        let fd = fdt.open("/tmp/f", OpenMode::Write).unwrap();
        fdt.write(fd, b"new").unwrap();
        // Not flushed until close.
        assert_eq!(vfs.read_file("/tmp/f").unwrap(), b"old contents");
        fdt.close(fd).unwrap();
        assert_eq!(vfs.read_file("/tmp/f").unwrap(), b"new");
    }

    #[test]
    fn append_positions_at_end_and_extends() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/log", b"one\n").unwrap();
        let fd = fdt.open("/tmp/log", OpenMode::Append).unwrap();
        assert_eq!(fdt.offset(fd).unwrap(), 4);
        fdt.write(fd, b"two\n").unwrap();
        fdt.close(fd).unwrap();
        assert_eq!(vfs.read_file("/tmp/log").unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn open_snapshots_bytes() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"before").unwrap();
        let fd = fdt.open("/tmp/f", OpenMode::Read).unwrap();
        vfs.write_file("/tmp/f", b"after!").unwrap();
        let mut buf = [0u8; 6];
        fdt.read(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"before");
    }

    #[test]
    fn seek_clamps_negative() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"abcdef").unwrap();
        let fd = fdt.open("/tmp/f", OpenMode::Read).unwrap();
        assert_eq!(fdt.seek(fd, SeekFrom::End(-2)).unwrap(), 4);
        assert_eq!(fdt.seek(fd, SeekFrom::Current(-100)).unwrap(), 0);
        assert_eq!(fdt.seek(fd, SeekFrom::Start(3)).unwrap(), 3);
    }

    #[test]
    fn dup_shares_buffer_with_independent_offset() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"xxxx").unwrap();
        let fd = fdt.open("/tmp/f", OpenMode::ReadWrite).unwrap();
        let dup = fdt.dup(fd).unwrap();
        fdt.seek(fd, SeekFrom::Start(2)).unwrap();
        fdt.write(fd, b"YY").unwrap();
        // The dup sees the write through the shared buffer but keeps its
        // own offset at zero.
        let mut buf = [0u8; 4];
        assert_eq!(fdt.read(dup, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"xxYY");
    }

    #[test]
    fn operations_on_closed_fd_are_ebadf() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"data").unwrap();
        let fd = fdt.open("/tmp/f", OpenMode::Read).unwrap();
        fdt.close(fd).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fdt.read(fd, &mut buf), Err(FsError::InvalidFd));
        assert_eq!(fdt.close(fd), Err(FsError::InvalidFd));
        assert_eq!(fdt.seek(fd, SeekFrom::Start(0)), Err(FsError::InvalidFd));
    }

    #[test]
    fn allocator_skips_control_fd() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"data").unwrap();
        // Fill every descriptor below the control fd, then allocate once
        // more: the allocator must step over 1023.
        for fd in FIRST_FD..CONTROL_FD {
            fdt.insert_placeholder(fd);
        }
        let fd = fdt.open("/tmp/f", OpenMode::Read).unwrap();
        assert_eq!(fd, CONTROL_FD + 1);
    }

    #[test]
    fn fork_decouples_buffers() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"base").unwrap();
        let fd = fdt.open("/tmp/f", OpenMode::ReadWrite).unwrap();
        let mut forked = fdt.fork(Arc::new(vfs.clone()));
        fdt.write(fd, b"MUT!").unwrap();
        let mut buf = [0u8; 4];
        forked.read(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"base");
    }

    #[test]
    fn set_len_truncates() {
        let (vfs, mut fdt) = table();
        vfs.write_file("/tmp/f", b"abcdef").unwrap();
        let fd = fdt.open("/tmp/f", OpenMode::ReadWrite).unwrap();
        fdt.set_len(fd, 2).unwrap();
        fdt.close(fd).unwrap();
        assert_eq!(vfs.read_file("/tmp/f").unwrap(), b"ab");
    }
}
