//! In-memory virtual filesystem for the wasmbox sandbox.
//!
//! The sandbox never touches the real filesystem: every file a guest sees
//! lives in an inode tree owned by a [`Vfs`]. On top of the tree sit
//! provider mounts ([`HostMount`], [`DevProvider`], [`ProcProvider`]),
//! whole-tree snapshots, copy-on-write forks and a change-notification
//! hook used by the persistence layer.
//!
//! Per-process state lives in [`FdTable`] (stateful descriptors over the
//! shared tree) and [`Pipe`] (the byte stream the shell uses to stitch
//! pipelines together).

mod error;
mod fd;
mod filesystem;
mod inode;
pub mod path;
mod pipe;
mod provider;
mod vfs;

pub use error::{FsError, Result};
pub use fd::{FdTable, OpenMode, CONTROL_FD, FIRST_FD};
pub use filesystem::{DirEntry, FileStat, FileSystem, FileType};
pub use inode::{Inode, InodeMeta};
pub use pipe::Pipe;
pub use provider::{DevProvider, HostMount, ProcProvider, SharedEnv, VirtualProvider};
pub use vfs::{ExportEntry, SnapshotId, Vfs, MAX_SYMLINK_HOPS};
