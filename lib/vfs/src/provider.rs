use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{FsError, Result};
use crate::filesystem::{DirEntry, FileStat, FileType};
use crate::inode::now_ms;

/// Shared environment map, the source of truth held by the shell host.
/// `ProcProvider` reflects it as `/proc/self/environ`.
pub type SharedEnv = Arc<RwLock<IndexMap<String, String>>>;

/// A synthetic subtree attached below a mount point.
///
/// Paths handed to a provider are relative to the mount point, with no
/// leading slash; the empty string addresses the mount root.
pub trait VirtualProvider: Debug + Send + Sync {
    fn read_file(&self, rel: &str) -> Result<Vec<u8>>;
    fn write_file(&self, rel: &str, data: &[u8]) -> Result<()>;
    fn read_dir(&self, rel: &str) -> Result<Vec<DirEntry>>;
    fn stat(&self, rel: &str) -> Result<FileStat>;
    fn exists(&self, rel: &str) -> bool {
        self.stat(rel).is_ok()
    }
    /// Independent copy for a filesystem fork. A provider that owns
    /// mutable state must deep-copy it; one that merely reflects
    /// host-owned state (like `/proc`) may hand back the same view.
    fn fork(&self) -> Arc<dyn VirtualProvider>;
}

fn file_stat(size: u64, mode: u32, created: u64) -> FileStat {
    FileStat {
        file_type: FileType::File,
        size,
        mode,
        atime: created,
        mtime: created,
        ctime: created,
    }
}

fn dir_stat(mode: u32, created: u64) -> FileStat {
    FileStat {
        file_type: FileType::Dir,
        size: 0,
        mode,
        atime: created,
        mtime: created,
        ctime: created,
    }
}

/// Read-only (or optionally writable) bundle of files supplied by the
/// host at mount time. Keys may contain slashes; intermediate
/// directories are implied.
#[derive(Debug)]
pub struct HostMount {
    files: RwLock<HashMap<String, Vec<u8>>>,
    writable: bool,
    created: u64,
}

impl HostMount {
    pub fn new(files: HashMap<String, Vec<u8>>) -> Self {
        HostMount {
            files: RwLock::new(files),
            writable: false,
            created: now_ms(),
        }
    }

    pub fn writable(files: HashMap<String, Vec<u8>>) -> Self {
        HostMount {
            files: RwLock::new(files),
            writable: true,
            created: now_ms(),
        }
    }

    /// Directory children implied by the key set under `rel`.
    fn children_of(&self, rel: &str) -> Vec<DirEntry> {
        let files = self.files.read();
        let prefix = if rel.is_empty() {
            String::new()
        } else {
            format!("{rel}/")
        };
        let mut seen: IndexMap<String, FileType> = IndexMap::new();
        for key in files.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if rest.is_empty() {
                    continue;
                }
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        seen.entry(dir.to_string()).or_insert(FileType::Dir);
                    }
                    None => {
                        seen.insert(rest.to_string(), FileType::File);
                    }
                }
            }
        }
        seen.into_iter()
            .map(|(name, file_type)| DirEntry { name, file_type })
            .collect()
    }

    fn is_implied_dir(&self, rel: &str) -> bool {
        if rel.is_empty() {
            return true;
        }
        let prefix = format!("{rel}/");
        self.files.read().keys().any(|k| k.starts_with(&prefix))
    }
}

impl VirtualProvider for HostMount {
    fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        if self.is_implied_dir(rel) {
            return Err(FsError::IsADirectory);
        }
        self.files
            .read()
            .get(rel)
            .cloned()
            .ok_or(FsError::EntryNotFound)
    }

    fn write_file(&self, rel: &str, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FsError::ReadOnly);
        }
        if rel.is_empty() || self.is_implied_dir(rel) {
            return Err(FsError::IsADirectory);
        }
        self.files.write().insert(rel.to_string(), data.to_vec());
        Ok(())
    }

    fn read_dir(&self, rel: &str) -> Result<Vec<DirEntry>> {
        if !self.is_implied_dir(rel) {
            return if self.files.read().contains_key(rel) {
                Err(FsError::BaseNotDirectory)
            } else {
                Err(FsError::EntryNotFound)
            };
        }
        Ok(self.children_of(rel))
    }

    fn stat(&self, rel: &str) -> Result<FileStat> {
        if self.is_implied_dir(rel) {
            return Ok(dir_stat(0o555, self.created));
        }
        let files = self.files.read();
        let data = files.get(rel).ok_or(FsError::EntryNotFound)?;
        let mode = if self.writable { 0o644 } else { 0o444 };
        Ok(file_stat(data.len() as u64, mode, self.created))
    }

    fn fork(&self) -> Arc<dyn VirtualProvider> {
        Arc::new(HostMount {
            files: RwLock::new(self.files.read().clone()),
            writable: self.writable,
            created: self.created,
        })
    }
}

/// `/dev`: the three character devices guests actually use.
#[derive(Debug)]
pub struct DevProvider {
    created: u64,
}

impl DevProvider {
    pub fn new() -> Self {
        DevProvider { created: now_ms() }
    }
}

impl Default for DevProvider {
    fn default() -> Self {
        Self::new()
    }
}

const DEV_NODES: [&str; 3] = ["null", "zero", "urandom"];
const URANDOM_READ_LEN: usize = 64;

impl VirtualProvider for DevProvider {
    fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        match rel {
            "null" | "zero" => Ok(Vec::new()),
            "urandom" => {
                let mut buf = vec![0u8; URANDOM_READ_LEN];
                getrandom::getrandom(&mut buf).map_err(|_| FsError::Unsupported)?;
                Ok(buf)
            }
            "" => Err(FsError::IsADirectory),
            _ => Err(FsError::EntryNotFound),
        }
    }

    fn write_file(&self, rel: &str, _data: &[u8]) -> Result<()> {
        match rel {
            // Writes to the character devices are discarded.
            "null" | "zero" | "urandom" => Ok(()),
            "" => Err(FsError::IsADirectory),
            _ => Err(FsError::ReadOnly),
        }
    }

    fn read_dir(&self, rel: &str) -> Result<Vec<DirEntry>> {
        if !rel.is_empty() {
            return Err(FsError::BaseNotDirectory);
        }
        Ok(DEV_NODES
            .iter()
            .map(|name| DirEntry {
                name: (*name).to_string(),
                file_type: FileType::File,
            })
            .collect())
    }

    fn stat(&self, rel: &str) -> Result<FileStat> {
        match rel {
            "" => Ok(dir_stat(0o555, self.created)),
            "null" | "zero" | "urandom" => Ok(file_stat(0, 0o666, self.created)),
            _ => Err(FsError::EntryNotFound),
        }
    }

    fn fork(&self) -> Arc<dyn VirtualProvider> {
        Arc::new(DevProvider {
            created: self.created,
        })
    }
}

/// `/proc`: a minimal process view, backed by the live environment map.
#[derive(Debug)]
pub struct ProcProvider {
    env: SharedEnv,
    cwd: Arc<RwLock<String>>,
    created: u64,
}

impl ProcProvider {
    pub fn new(env: SharedEnv, cwd: Arc<RwLock<String>>) -> Self {
        ProcProvider {
            env,
            cwd,
            created: now_ms(),
        }
    }

    fn environ_bytes(&self) -> Vec<u8> {
        let env = self.env.read();
        let mut out = Vec::new();
        for (k, v) in env.iter() {
            out.extend_from_slice(k.as_bytes());
            out.push(b'=');
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out
    }
}

const PROC_VERSION: &str = "wasmbox virtual kernel\n";

impl VirtualProvider for ProcProvider {
    fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        match rel {
            "self/environ" => Ok(self.environ_bytes()),
            "self/cwd" => Ok(self.cwd.read().clone().into_bytes()),
            "version" => Ok(PROC_VERSION.as_bytes().to_vec()),
            "" | "self" => Err(FsError::IsADirectory),
            _ => Err(FsError::EntryNotFound),
        }
    }

    fn write_file(&self, _rel: &str, _data: &[u8]) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    fn read_dir(&self, rel: &str) -> Result<Vec<DirEntry>> {
        match rel {
            "" => Ok(vec![
                DirEntry {
                    name: "self".to_string(),
                    file_type: FileType::Dir,
                },
                DirEntry {
                    name: "version".to_string(),
                    file_type: FileType::File,
                },
            ]),
            "self" => Ok(vec![
                DirEntry {
                    name: "environ".to_string(),
                    file_type: FileType::File,
                },
                DirEntry {
                    name: "cwd".to_string(),
                    file_type: FileType::File,
                },
            ]),
            _ => Err(FsError::BaseNotDirectory),
        }
    }

    fn stat(&self, rel: &str) -> Result<FileStat> {
        match rel {
            "" | "self" => Ok(dir_stat(0o555, self.created)),
            "self/environ" => Ok(file_stat(
                self.environ_bytes().len() as u64,
                0o444,
                self.created,
            )),
            "self/cwd" => Ok(file_stat(
                self.cwd.read().len() as u64,
                0o444,
                self.created,
            )),
            "version" => Ok(file_stat(PROC_VERSION.len() as u64, 0o444, self.created)),
            _ => Err(FsError::EntryNotFound),
        }
    }

    /// `/proc` is a read-only reflection of host-owned state; a fork
    /// keeps the same view until its owner rebinds it to the fork's own
    /// environment.
    fn fork(&self) -> Arc<dyn VirtualProvider> {
        Arc::new(ProcProvider {
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            created: self.created,
        })
    }
}
