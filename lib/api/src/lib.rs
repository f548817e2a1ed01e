//! wasmbox: a user-space sandbox that runs untrusted shell pipelines
//! and Python programs as WebAssembly guests over a synthetic UNIX-like
//! environment.
//!
//! A [`Sandbox`] owns one virtual filesystem, one environment map, one
//! persistence binding and one optional worker slot. Guests see a
//! POSIX-shaped world assembled from the sibling crates: `wasmbox-vfs`
//! (files), `wasmbox-wasi` (syscalls), `wasmbox-runtime` (processes and
//! the shell), `wasmbox-net` (policied networking).

mod backend;
mod config;
mod error;
mod manager;
mod persist;
mod proxy;
mod sandbox;
mod worker;

pub use backend::{FileBackend, MemoryBackend, PersistenceBackend};
pub use config::{MountConfig, PersistenceConfig, PersistenceMode, SandboxConfig};
pub use error::SandboxError;
pub use manager::PersistenceManager;
pub use persist::{export_state, import_state, BLOB_MAGIC, BLOB_VERSION};
pub use sandbox::Sandbox;
pub use worker::WorkerExecutor;

pub use wasmbox_net::{NetworkPolicy, SyncFetcher};
pub use wasmbox_runtime::{ErrorClass, ExtensionConfig, Limits, RunResult};
pub use wasmbox_vfs::{FileStat, FileType, FsError, SnapshotId, Vfs};
