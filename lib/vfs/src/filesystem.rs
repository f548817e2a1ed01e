use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Dir,
    Symlink,
}

/// Stat result for a path. Serializable because it crosses the worker
/// proxy boundary as JSON metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// One entry of a directory listing, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

/// Path-based filesystem operations shared by the in-memory [`crate::Vfs`]
/// and the worker-side proxy that tunnels the same calls over shared
/// memory. All paths are absolute POSIX strings; implementations
/// normalize internally.
pub trait FileSystem: Debug + Send + Sync {
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;
    /// Append to an existing file, creating it if absent.
    fn append_file(&self, path: &str, data: &[u8]) -> Result<()>;
    fn mkdir(&self, path: &str) -> Result<()>;
    /// `mkdir -p`: create missing ancestors, succeed if the directory
    /// already exists.
    fn mkdirp(&self, path: &str) -> Result<()>;
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
    /// Stat, following symlinks.
    fn stat(&self, path: &str) -> Result<FileStat>;
    /// Stat without following a trailing symlink.
    fn lstat(&self, path: &str) -> Result<FileStat>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn chmod(&self, path: &str, mode: u32) -> Result<()>;
    fn symlink(&self, target: &str, link: &str) -> Result<()>;
    fn read_link(&self, path: &str) -> Result<String>;
    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }
}
