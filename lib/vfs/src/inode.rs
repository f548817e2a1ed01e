use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;

use crate::filesystem::FileType;

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Attributes shared by every inode kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMeta {
    pub mode: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl InodeMeta {
    pub fn new(mode: u32) -> Self {
        let now = now_ms();
        InodeMeta {
            mode,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Record a content mutation.
    pub fn touch(&mut self) {
        let now = now_ms();
        self.mtime = now;
        self.atime = now;
    }
}

/// A node of the virtual filesystem tree.
///
/// Inodes are owned by exactly one parent directory (the root is owned by
/// the [`crate::Vfs`] itself), so `Clone` gives a deep copy of the whole
/// subtree. Snapshots and copy-on-write forks rely on exactly that.
///
/// Directory entries keep insertion order; listings reflect creation
/// order rather than lexicographic order.
#[derive(Debug, Clone)]
pub enum Inode {
    File {
        data: Vec<u8>,
        meta: InodeMeta,
    },
    Dir {
        entries: IndexMap<String, Inode>,
        meta: InodeMeta,
    },
    Symlink {
        target: String,
        meta: InodeMeta,
    },
}

impl Inode {
    pub fn new_file(data: Vec<u8>) -> Self {
        Inode::File {
            data,
            meta: InodeMeta::new(0o644),
        }
    }

    pub fn new_dir() -> Self {
        Inode::Dir {
            entries: IndexMap::new(),
            meta: InodeMeta::new(0o755),
        }
    }

    pub fn new_symlink(target: impl Into<String>) -> Self {
        Inode::Symlink {
            target: target.into(),
            meta: InodeMeta::new(0o777),
        }
    }

    pub fn file_type(&self) -> FileType {
        match self {
            Inode::File { .. } => FileType::File,
            Inode::Dir { .. } => FileType::Dir,
            Inode::Symlink { .. } => FileType::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Inode::Dir { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Inode::File { .. })
    }

    pub fn meta(&self) -> &InodeMeta {
        match self {
            Inode::File { meta, .. } | Inode::Dir { meta, .. } | Inode::Symlink { meta, .. } => {
                meta
            }
        }
    }

    pub fn meta_mut(&mut self) -> &mut InodeMeta {
        match self {
            Inode::File { meta, .. } | Inode::Dir { meta, .. } | Inode::Symlink { meta, .. } => {
                meta
            }
        }
    }

    /// Content size: byte length for files, zero otherwise.
    pub fn size(&self) -> u64 {
        match self {
            Inode::File { data, .. } => data.len() as u64,
            Inode::Symlink { target, .. } => target.len() as u64,
            Inode::Dir { .. } => 0,
        }
    }
}
