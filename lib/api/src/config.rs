use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use wasmbox_net::NetworkPolicy;
use wasmbox_runtime::{ExtensionConfig, Limits};
use wasmbox_vfs::VirtualProvider;

use crate::backend::PersistenceBackend;

/// A provider attached at sandbox construction: either a flat file map
/// (served by a `HostMount`) or a caller-supplied provider.
pub struct MountConfig {
    pub path: String,
    pub files: HashMap<String, Vec<u8>>,
    pub writable: bool,
    pub provider: Option<Arc<dyn VirtualProvider>>,
}

impl MountConfig {
    pub fn files(path: impl Into<String>, files: HashMap<String, Vec<u8>>) -> Self {
        MountConfig {
            path: path.into(),
            files,
            writable: false,
            provider: None,
        }
    }

    pub fn writable(path: impl Into<String>, files: HashMap<String, Vec<u8>>) -> Self {
        MountConfig {
            path: path.into(),
            files,
            writable: true,
            provider: None,
        }
    }

    pub fn provider(path: impl Into<String>, provider: Arc<dyn VirtualProvider>) -> Self {
        MountConfig {
            path: path.into(),
            files: HashMap::new(),
            writable: false,
            provider: Some(provider),
        }
    }
}

impl fmt::Debug for MountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountConfig")
            .field("path", &self.path)
            .field("files", &self.files.len())
            .field("writable", &self.writable)
            .field("provider", &self.provider.as_ref().map(|_| "<provider>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceMode {
    /// Nothing is saved.
    #[default]
    Ephemeral,
    /// State lives in a process-local backend.
    Session,
    /// State lives in a durable backend supplied by the caller.
    Persistent,
}

pub struct PersistenceConfig {
    pub mode: PersistenceMode,
    pub namespace: String,
    pub autosave_ms: u64,
    pub backend: Option<Arc<dyn PersistenceBackend>>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            mode: PersistenceMode::Ephemeral,
            namespace: "default".to_string(),
            autosave_ms: 1000,
            backend: None,
        }
    }
}

impl fmt::Debug for PersistenceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceConfig")
            .field("mode", &self.mode)
            .field("namespace", &self.namespace)
            .field("autosave_ms", &self.autosave_ms)
            .field("backend", &self.backend.as_ref().map(|_| "<backend>"))
            .finish()
    }
}

/// Everything a [`crate::Sandbox`] is built from.
#[derive(Debug, Default)]
pub struct SandboxConfig {
    /// Directory of `*.wasm` tool binaries; each file registers a tool
    /// under its stem.
    pub wasm_dir: Option<PathBuf>,
    /// In-memory modules keyed by location; `*.wasm` keys register as
    /// tools. Used by embedders and tests.
    pub module_bundle: HashMap<String, Vec<u8>>,
    /// Location of the shell-parser guest. Defaults to `shell.wasm`.
    pub shell_wasm_path: Option<String>,
    pub mounts: Vec<MountConfig>,
    /// Prepended to the default `/usr/lib/python` and exported as
    /// `PYTHONPATH`.
    pub python_path: Vec<String>,
    pub network: Option<NetworkPolicy>,
    pub limits: Limits,
    /// Default deadline for `run`.
    pub timeout_ms: Option<u64>,
    pub persistence: PersistenceConfig,
    pub extensions: Vec<ExtensionConfig>,
    /// Execute runs on a background worker thread with a VFS proxy.
    pub use_worker: bool,
}
