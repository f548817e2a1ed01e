use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{FsError, Result};
use crate::filesystem::{DirEntry, FileStat, FileSystem, FileType};
use crate::inode::{now_ms, Inode};
use crate::path;
use crate::provider::VirtualProvider;

/// Symlink chain bound; exceeding it fails with `TooManySymlinks`.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Handle to a whole-tree snapshot taken with [`Vfs::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(u64);

/// One entry of the serializable core tree, emitted parent-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub path: String,
    pub file_type: FileType,
    pub data: Option<Vec<u8>>,
    pub mode: u32,
}

type ChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Mount {
    path: String,
    provider: Arc<dyn VirtualProvider>,
}

struct VfsState {
    root: Inode,
    mounts: Vec<Mount>,
    snapshots: HashMap<u64, Inode>,
    next_snapshot_id: u64,
    on_change: Option<ChangeCallback>,
    max_files: Option<usize>,
}

/// Where a path resolves to after symlink expansion and mount matching.
enum Target {
    /// Canonical symlink-free path inside the core tree.
    Core(String),
    /// Mount index plus the remainder relative to the mount point.
    Mounted(usize, String),
}

fn find_mount(mounts: &[Mount], p: &str) -> Option<(usize, String)> {
    let mut best: Option<(usize, usize)> = None;
    for (i, m) in mounts.iter().enumerate() {
        let matches =
            m.path == "/" || p == m.path || p.starts_with(&format!("{}/", m.path));
        if matches && best.map_or(true, |(_, len)| m.path.len() > len) {
            best = Some((i, m.path.len()));
        }
    }
    best.map(|(i, _)| {
        let rel = p[mounts[i].path.len()..]
            .trim_start_matches('/')
            .to_string();
        (i, rel)
    })
}

fn resolve(state: &VfsState, raw: &str, follow_last: bool) -> Result<Target> {
    let mut p = path::normalize(raw);
    let mut hops = 0usize;
    'restart: loop {
        if let Some((idx, rel)) = find_mount(&state.mounts, &p) {
            return Ok(Target::Mounted(idx, rel));
        }
        let comps: Vec<String> = path::split(&p).iter().map(|c| c.to_string()).collect();
        let mut cur = &state.root;
        let mut walked = String::new();
        for (i, comp) in comps.iter().enumerate() {
            let entries = match cur {
                Inode::Dir { entries, .. } => entries,
                _ => return Err(FsError::BaseNotDirectory),
            };
            let child = entries.get(comp.as_str()).ok_or(FsError::EntryNotFound)?;
            let last = i + 1 == comps.len();
            if let Inode::Symlink { target, .. } = child {
                if !last || follow_last {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(FsError::TooManySymlinks);
                    }
                    let base = if walked.is_empty() { "/" } else { walked.as_str() };
                    let mut rewritten = path::join(base, target);
                    for rest in &comps[i + 1..] {
                        rewritten.push('/');
                        rewritten.push_str(rest);
                    }
                    p = path::normalize(&rewritten);
                    continue 'restart;
                }
            }
            walked.push('/');
            walked.push_str(comp);
            cur = child;
        }
        return Ok(Target::Core(if walked.is_empty() {
            "/".to_string()
        } else {
            walked
        }));
    }
}

fn node_at<'a>(state: &'a VfsState, canonical: &str) -> Result<&'a Inode> {
    let mut cur = &state.root;
    for comp in path::split(canonical) {
        match cur {
            Inode::Dir { entries, .. } => {
                cur = entries.get(comp).ok_or(FsError::EntryNotFound)?;
            }
            _ => return Err(FsError::BaseNotDirectory),
        }
    }
    Ok(cur)
}

fn node_at_mut<'a>(state: &'a mut VfsState, canonical: &str) -> Result<&'a mut Inode> {
    let mut cur = &mut state.root;
    for comp in path::split(canonical) {
        match cur {
            Inode::Dir { entries, .. } => {
                cur = entries.get_mut(comp).ok_or(FsError::EntryNotFound)?;
            }
            _ => return Err(FsError::BaseNotDirectory),
        }
    }
    Ok(cur)
}

fn dir_entries_mut<'a>(
    state: &'a mut VfsState,
    canonical: &str,
) -> Result<&'a mut IndexMap<String, Inode>> {
    match node_at_mut(state, canonical)? {
        Inode::Dir { entries, .. } => Ok(entries),
        _ => Err(FsError::BaseNotDirectory),
    }
}

fn count_files(node: &Inode) -> usize {
    match node {
        Inode::File { .. } => 1,
        Inode::Symlink { .. } => 0,
        Inode::Dir { entries, .. } => entries.values().map(count_files).sum(),
    }
}

fn check_quota(state: &VfsState) -> Result<()> {
    if let Some(max) = state.max_files {
        if count_files(&state.root) >= max {
            return Err(FsError::QuotaExceeded);
        }
    }
    Ok(())
}

fn stat_of(node: &Inode) -> FileStat {
    let meta = node.meta();
    FileStat {
        file_type: node.file_type(),
        size: node.size(),
        mode: meta.mode,
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// The sandbox filesystem: an owned inode tree plus provider mounts,
/// snapshots and copy-on-write forks.
///
/// `Vfs` is a cheap shared handle; `clone()` aliases the same tree (what
/// every spawn of one sandbox sees), while [`Vfs::fork`] produces a fully
/// isolated copy.
#[derive(Clone)]
pub struct Vfs {
    state: Arc<RwLock<VfsState>>,
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs").finish_non_exhaustive()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Fresh filesystem with the default sandbox layout and a `/dev`
    /// provider mount.
    pub fn new() -> Self {
        let vfs = Self::bare();
        for dir in ["/home/user", "/tmp", "/bin", "/usr/bin", "/usr/lib/python"] {
            let _ = vfs.mkdirp(dir);
        }
        let _ = vfs.mount("/dev", Arc::new(crate::provider::DevProvider::new()));
        vfs
    }

    /// Empty filesystem: no layout, no mounts. Used by restore paths and
    /// tests.
    pub fn bare() -> Self {
        Vfs {
            state: Arc::new(RwLock::new(VfsState {
                root: Inode::new_dir(),
                mounts: Vec::new(),
                snapshots: HashMap::new(),
                next_snapshot_id: 1,
                on_change: None,
                max_files: None,
            })),
        }
    }

    /// Cap the number of regular files in the core tree; further creates
    /// fail with `QuotaExceeded`.
    pub fn set_max_files(&self, max: Option<usize>) {
        self.state.write().max_files = max;
    }

    pub fn file_count(&self) -> usize {
        count_files(&self.state.read().root)
    }

    pub fn set_on_change(&self, cb: Option<ChangeCallback>) {
        self.state.write().on_change = cb;
    }

    fn fire_change(&self, changed: &str) {
        let cb = self.state.read().on_change.clone();
        if let Some(cb) = cb {
            cb(changed);
        }
    }

    /// Attach a provider at `mount_path`. The mount point directory is
    /// created in the core tree so parent listings show it.
    pub fn mount(&self, mount_path: &str, provider: Arc<dyn VirtualProvider>) -> Result<()> {
        let norm = path::normalize(mount_path);
        if norm == "/" {
            return Err(FsError::InvalidInput);
        }
        if self.state.read().mounts.iter().any(|m| m.path == norm) {
            return Err(FsError::AlreadyExists);
        }
        self.mkdirp_inner(&norm, false)?;
        self.state.write().mounts.push(Mount {
            path: norm.clone(),
            provider,
        });
        tracing::debug!(path = %norm, "mounted provider");
        Ok(())
    }

    pub fn unmount(&self, mount_path: &str) -> Result<()> {
        let norm = path::normalize(mount_path);
        let mut state = self.state.write();
        let before = state.mounts.len();
        state.mounts.retain(|m| m.path != norm);
        if state.mounts.len() == before {
            return Err(FsError::EntryNotFound);
        }
        Ok(())
    }

    pub fn mount_points(&self) -> Vec<String> {
        self.state
            .read()
            .mounts
            .iter()
            .map(|m| m.path.clone())
            .collect()
    }

    /// Capture the current core tree. Snapshots survive later mutation
    /// and restores.
    pub fn snapshot(&self) -> SnapshotId {
        let mut state = self.state.write();
        let id = state.next_snapshot_id;
        state.next_snapshot_id += 1;
        let tree = state.root.clone();
        state.snapshots.insert(id, tree);
        SnapshotId(id)
    }

    /// Replace the core tree with a deep copy of the snapshot's tree.
    pub fn restore(&self, id: SnapshotId) -> Result<()> {
        {
            let mut state = self.state.write();
            let tree = state
                .snapshots
                .get(&id.0)
                .ok_or(FsError::EntryNotFound)?
                .clone();
            state.root = tree;
        }
        self.fire_change("/");
        Ok(())
    }

    /// Copy-on-write fork: a new filesystem sharing no mutable state
    /// with this one. Every mounted provider is forked along with the
    /// tree; the change hook is not carried over.
    pub fn fork(&self) -> Vfs {
        let state = self.state.read();
        let mounts = state
            .mounts
            .iter()
            .map(|m| Mount {
                path: m.path.clone(),
                provider: m.provider.fork(),
            })
            .collect();
        Vfs {
            state: Arc::new(RwLock::new(VfsState {
                root: state.root.clone(),
                mounts,
                snapshots: state.snapshots.clone(),
                next_snapshot_id: state.next_snapshot_id,
                on_change: None,
                max_files: state.max_files,
            })),
        }
    }

    /// Serialize the core tree, excluding anything at or under a mount
    /// point.
    pub fn export_entries(&self) -> Vec<ExportEntry> {
        fn walk(state: &VfsState, node: &Inode, prefix: &str, out: &mut Vec<ExportEntry>) {
            if let Inode::Dir { entries, .. } = node {
                for (name, child) in entries {
                    let p = child_path(prefix, name);
                    if find_mount(&state.mounts, &p).is_some() {
                        continue;
                    }
                    match child {
                        Inode::File { data, meta } => out.push(ExportEntry {
                            path: p,
                            file_type: FileType::File,
                            data: Some(data.clone()),
                            mode: meta.mode,
                        }),
                        Inode::Symlink { target, meta } => out.push(ExportEntry {
                            path: p,
                            file_type: FileType::Symlink,
                            data: Some(target.clone().into_bytes()),
                            mode: meta.mode,
                        }),
                        Inode::Dir { meta, .. } => {
                            out.push(ExportEntry {
                                path: p.clone(),
                                file_type: FileType::Dir,
                                data: None,
                                mode: meta.mode,
                            });
                            walk(state, child, &p, out);
                        }
                    }
                }
            }
        }
        let state = self.state.read();
        let mut out = Vec::new();
        walk(&state, &state.root, "/", &mut out);
        out
    }

    /// Replace the core tree from serialized entries. Mounts are
    /// preserved; their mount-point directories are recreated. Fires a
    /// single change notification for the whole load.
    pub fn import_entries(&self, entries: &[ExportEntry]) -> Result<()> {
        {
            let mut state = self.state.write();
            state.root = Inode::new_dir();
        }
        for entry in entries {
            match entry.file_type {
                FileType::Dir => {
                    self.mkdirp_inner(&entry.path, false)?;
                    self.chmod_inner(&entry.path, entry.mode, false)?;
                }
                FileType::File => {
                    if let Some(parent) = path::parent(&entry.path) {
                        self.mkdirp_inner(&parent, false)?;
                    }
                    self.write_file_inner(
                        &entry.path,
                        entry.data.as_deref().unwrap_or_default(),
                        false,
                    )?;
                    self.chmod_inner(&entry.path, entry.mode, false)?;
                }
                FileType::Symlink => {
                    if let Some(parent) = path::parent(&entry.path) {
                        self.mkdirp_inner(&parent, false)?;
                    }
                    let target =
                        String::from_utf8_lossy(entry.data.as_deref().unwrap_or_default())
                            .into_owned();
                    self.symlink_inner(&target, &entry.path, false)?;
                }
            }
        }
        for mp in self.mount_points() {
            self.mkdirp_inner(&mp, false)?;
        }
        self.fire_change("/");
        Ok(())
    }

    fn write_file_inner(&self, raw: &str, data: &[u8], notify: bool) -> Result<()> {
        let canonical;
        {
            let mut state = self.state.write();
            match resolve(&state, raw, true) {
                Ok(Target::Mounted(idx, rel)) => {
                    let provider = state.mounts[idx].provider.clone();
                    drop(state);
                    return provider.write_file(&rel, data);
                }
                Ok(Target::Core(canon)) => {
                    match node_at_mut(&mut state, &canon)? {
                        Inode::File { data: existing, meta } => {
                            *existing = data.to_vec();
                            meta.touch();
                        }
                        Inode::Dir { .. } => return Err(FsError::IsADirectory),
                        Inode::Symlink { .. } => return Err(FsError::InvalidInput),
                    }
                    canonical = canon;
                }
                Err(FsError::EntryNotFound) => {
                    let norm = path::normalize(raw);
                    let parent_raw = path::parent(&norm).ok_or(FsError::InvalidInput)?;
                    let name = path::file_name(&norm).ok_or(FsError::InvalidInput)?;
                    let parent_canon = match resolve(&state, &parent_raw, true)? {
                        Target::Core(c) => c,
                        Target::Mounted(idx, rel) => {
                            let provider = state.mounts[idx].provider.clone();
                            drop(state);
                            let rel_file =
                                if rel.is_empty() { name } else { format!("{rel}/{name}") };
                            return provider.write_file(&rel_file, data);
                        }
                    };
                    // A dangling symlink at the final component redirects
                    // the create to its target.
                    if let Some(Inode::Symlink { target, .. }) =
                        dir_entries_mut(&mut state, &parent_canon)?.get(&name)
                    {
                        let redirected = path::join(&parent_canon, target);
                        drop(state);
                        return self.write_file_inner(&redirected, data, notify);
                    }
                    check_quota(&state)?;
                    dir_entries_mut(&mut state, &parent_canon)?
                        .insert(name.clone(), Inode::new_file(data.to_vec()));
                    canonical = child_path(&parent_canon, &name);
                }
                Err(err) => return Err(err),
            }
        }
        if notify {
            self.fire_change(&canonical);
        }
        Ok(())
    }

    fn mkdir_inner(&self, raw: &str, notify: bool) -> Result<()> {
        let canonical;
        {
            let mut state = self.state.write();
            match resolve(&state, raw, true) {
                Ok(Target::Core(_)) => return Err(FsError::AlreadyExists),
                Ok(Target::Mounted(_, rel)) if rel.is_empty() => {
                    return Err(FsError::AlreadyExists)
                }
                Ok(Target::Mounted(..)) => return Err(FsError::Unsupported),
                Err(FsError::EntryNotFound) => {}
                Err(err) => return Err(err),
            }
            let norm = path::normalize(raw);
            let parent_raw = path::parent(&norm).ok_or(FsError::InvalidInput)?;
            let name = path::file_name(&norm).ok_or(FsError::InvalidInput)?;
            let parent_canon = match resolve(&state, &parent_raw, true)? {
                Target::Core(c) => c,
                Target::Mounted(..) => return Err(FsError::Unsupported),
            };
            let entries = dir_entries_mut(&mut state, &parent_canon)?;
            if entries.contains_key(&name) {
                return Err(FsError::AlreadyExists);
            }
            entries.insert(name.clone(), Inode::new_dir());
            canonical = child_path(&parent_canon, &name);
        }
        if notify {
            self.fire_change(&canonical);
        }
        Ok(())
    }

    fn mkdirp_inner(&self, raw: &str, notify: bool) -> Result<()> {
        let norm = path::normalize(raw);
        let mut built = String::new();
        let mut created_any = false;
        for comp in path::split(&norm) {
            built.push('/');
            built.push_str(comp);
            match self.stat(&built) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) => return Err(FsError::BaseNotDirectory),
                Err(FsError::EntryNotFound) => match self.mkdir_inner(&built, false) {
                    Ok(()) => created_any = true,
                    Err(FsError::AlreadyExists) => {}
                    Err(err) => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
        if created_any && notify {
            self.fire_change(&norm);
        }
        Ok(())
    }

    fn chmod_inner(&self, raw: &str, mode: u32, notify: bool) -> Result<()> {
        let canonical;
        {
            let mut state = self.state.write();
            match resolve(&state, raw, true)? {
                Target::Mounted(..) => return Err(FsError::Unsupported),
                Target::Core(canon) => {
                    let meta = node_at_mut(&mut state, &canon)?.meta_mut();
                    meta.mode = mode;
                    meta.ctime = now_ms();
                    canonical = canon;
                }
            }
        }
        if notify {
            self.fire_change(&canonical);
        }
        Ok(())
    }

    fn symlink_inner(&self, target: &str, link: &str, notify: bool) -> Result<()> {
        let canonical;
        {
            let mut state = self.state.write();
            let norm = path::normalize(link);
            if find_mount(&state.mounts, &norm).is_some() {
                return Err(FsError::Unsupported);
            }
            let parent_raw = path::parent(&norm).ok_or(FsError::InvalidInput)?;
            let name = path::file_name(&norm).ok_or(FsError::InvalidInput)?;
            let parent_canon = match resolve(&state, &parent_raw, true)? {
                Target::Core(c) => c,
                Target::Mounted(..) => return Err(FsError::Unsupported),
            };
            let entries = dir_entries_mut(&mut state, &parent_canon)?;
            if entries.contains_key(&name) {
                return Err(FsError::AlreadyExists);
            }
            entries.insert(name.clone(), Inode::new_symlink(target));
            canonical = child_path(&parent_canon, &name);
        }
        if notify {
            self.fire_change(&canonical);
        }
        Ok(())
    }
}

impl FileSystem for Vfs {
    fn read_file(&self, raw: &str) -> Result<Vec<u8>> {
        let state = self.state.read();
        match resolve(&state, raw, true)? {
            Target::Mounted(idx, rel) => {
                let provider = state.mounts[idx].provider.clone();
                drop(state);
                provider.read_file(&rel)
            }
            Target::Core(canon) => match node_at(&state, &canon)? {
                Inode::File { data, .. } => Ok(data.clone()),
                Inode::Dir { .. } => Err(FsError::IsADirectory),
                Inode::Symlink { .. } => Err(FsError::InvalidInput),
            },
        }
    }

    fn write_file(&self, raw: &str, data: &[u8]) -> Result<()> {
        self.write_file_inner(raw, data, true)
    }

    fn append_file(&self, raw: &str, data: &[u8]) -> Result<()> {
        let mut combined = match self.read_file(raw) {
            Ok(bytes) => bytes,
            Err(FsError::EntryNotFound) => Vec::new(),
            Err(err) => return Err(err),
        };
        combined.extend_from_slice(data);
        self.write_file(raw, &combined)
    }

    fn mkdir(&self, raw: &str) -> Result<()> {
        self.mkdir_inner(raw, true)
    }

    fn mkdirp(&self, raw: &str) -> Result<()> {
        self.mkdirp_inner(raw, true)
    }

    fn read_dir(&self, raw: &str) -> Result<Vec<DirEntry>> {
        let state = self.state.read();
        match resolve(&state, raw, true)? {
            Target::Mounted(idx, rel) => {
                let mut entries = state.mounts[idx].provider.read_dir(&rel)?;
                // A mount point shadows the physical directory; merge any
                // physical children underneath, mount names winning.
                if rel.is_empty() {
                    let canonical = state.mounts[idx].path.clone();
                    if let Ok(Inode::Dir { entries: phys, .. }) = node_at(&state, &canonical) {
                        for (name, child) in phys {
                            if !entries.iter().any(|e| &e.name == name) {
                                entries.push(DirEntry {
                                    name: name.clone(),
                                    file_type: child.file_type(),
                                });
                            }
                        }
                    }
                }
                Ok(entries)
            }
            Target::Core(canon) => match node_at(&state, &canon)? {
                Inode::Dir { entries, .. } => Ok(entries
                    .iter()
                    .map(|(name, child)| DirEntry {
                        name: name.clone(),
                        file_type: child.file_type(),
                    })
                    .collect()),
                _ => Err(FsError::BaseNotDirectory),
            },
        }
    }

    fn stat(&self, raw: &str) -> Result<FileStat> {
        let state = self.state.read();
        match resolve(&state, raw, true)? {
            Target::Mounted(idx, rel) => state.mounts[idx].provider.stat(&rel),
            Target::Core(canon) => Ok(stat_of(node_at(&state, &canon)?)),
        }
    }

    fn lstat(&self, raw: &str) -> Result<FileStat> {
        let state = self.state.read();
        match resolve(&state, raw, false)? {
            Target::Mounted(idx, rel) => state.mounts[idx].provider.stat(&rel),
            Target::Core(canon) => Ok(stat_of(node_at(&state, &canon)?)),
        }
    }

    fn unlink(&self, raw: &str) -> Result<()> {
        let canonical;
        {
            let mut state = self.state.write();
            let canon = match resolve(&state, raw, false)? {
                Target::Mounted(..) => return Err(FsError::Unsupported),
                Target::Core(c) => c,
            };
            if canon == "/" {
                return Err(FsError::IsADirectory);
            }
            let parent = path::parent(&canon).ok_or(FsError::InvalidInput)?;
            let name = path::file_name(&canon).ok_or(FsError::InvalidInput)?;
            let entries = dir_entries_mut(&mut state, &parent)?;
            match entries.get(&name) {
                Some(Inode::Dir { .. }) => return Err(FsError::IsADirectory),
                Some(_) => {
                    entries.shift_remove(&name);
                }
                None => return Err(FsError::EntryNotFound),
            }
            canonical = canon;
        }
        self.fire_change(&canonical);
        Ok(())
    }

    fn rmdir(&self, raw: &str) -> Result<()> {
        let canonical;
        {
            let mut state = self.state.write();
            let canon = match resolve(&state, raw, false)? {
                Target::Mounted(..) => return Err(FsError::Unsupported),
                Target::Core(c) => c,
            };
            if canon == "/" {
                return Err(FsError::InvalidInput);
            }
            let parent = path::parent(&canon).ok_or(FsError::InvalidInput)?;
            let name = path::file_name(&canon).ok_or(FsError::InvalidInput)?;
            let entries = dir_entries_mut(&mut state, &parent)?;
            match entries.get(&name) {
                Some(Inode::Dir {
                    entries: children, ..
                }) => {
                    if !children.is_empty() {
                        return Err(FsError::DirectoryNotEmpty);
                    }
                    entries.shift_remove(&name);
                }
                Some(_) => return Err(FsError::BaseNotDirectory),
                None => return Err(FsError::EntryNotFound),
            }
            canonical = canon;
        }
        self.fire_change(&canonical);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let dest;
        {
            let mut state = self.state.write();
            let from_canon = match resolve(&state, from, false)? {
                Target::Mounted(..) => return Err(FsError::Unsupported),
                Target::Core(c) => c,
            };
            if from_canon == "/" {
                return Err(FsError::InvalidInput);
            }
            let to_norm = path::normalize(to);
            if find_mount(&state.mounts, &to_norm).is_some() {
                return Err(FsError::Unsupported);
            }
            let from_parent = path::parent(&from_canon).ok_or(FsError::InvalidInput)?;
            let from_name = path::file_name(&from_canon).ok_or(FsError::InvalidInput)?;
            let node = dir_entries_mut(&mut state, &from_parent)?
                .shift_remove(&from_name)
                .ok_or(FsError::EntryNotFound)?;

            let restore = |state: &mut VfsState, node: Inode| {
                if let Ok(entries) = dir_entries_mut(state, &from_parent) {
                    entries.insert(from_name.clone(), node);
                }
            };

            let (to_parent_raw, to_name) =
                match (path::parent(&to_norm), path::file_name(&to_norm)) {
                    (Some(p), Some(n)) => (p, n),
                    _ => {
                        restore(&mut state, node);
                        return Err(FsError::InvalidInput);
                    }
                };
            let to_parent = match resolve(&state, &to_parent_raw, true) {
                Ok(Target::Core(c)) => c,
                Ok(Target::Mounted(..)) => {
                    restore(&mut state, node);
                    return Err(FsError::Unsupported);
                }
                Err(err) => {
                    restore(&mut state, node);
                    return Err(err);
                }
            };
            let entries = match dir_entries_mut(&mut state, &to_parent) {
                Ok(e) => e,
                Err(err) => {
                    restore(&mut state, node);
                    return Err(err);
                }
            };
            if matches!(entries.get(&to_name), Some(Inode::Dir { .. })) {
                restore(&mut state, node);
                return Err(FsError::IsADirectory);
            }
            entries.shift_remove(&to_name);
            entries.insert(to_name.clone(), node);
            dest = child_path(&to_parent, &to_name);
        }
        self.fire_change(&dest);
        Ok(())
    }

    fn chmod(&self, raw: &str, mode: u32) -> Result<()> {
        self.chmod_inner(raw, mode, true)
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.symlink_inner(target, link, true)
    }

    fn read_link(&self, raw: &str) -> Result<String> {
        let state = self.state.read();
        match resolve(&state, raw, false)? {
            Target::Mounted(..) => Err(FsError::InvalidInput),
            Target::Core(canon) => match node_at(&state, &canon)? {
                Inode::Symlink { target, .. } => Ok(target.clone()),
                _ => Err(FsError::InvalidInput),
            },
        }
    }
}
