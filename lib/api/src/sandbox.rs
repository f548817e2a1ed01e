use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use wasmbox_net::{FetchBridge, NetworkGateway, SyncFetcher};
use wasmbox_runtime::{
    ExtensionRegistry, Limits, ModuleSource, PlatformAdapter, ProcessManager, RunResult,
    ShellHost, ShellRunner,
};
use wasmbox_vfs::{
    DirEntry, FileStat, FileSystem, HostMount, ProcProvider, SharedEnv, SnapshotId, Vfs,
    VirtualProvider,
};
use wasmbox_wasi::CancelToken;

use crate::backend::MemoryBackend;
use crate::config::{PersistenceMode, SandboxConfig};
use crate::error::SandboxError;
use crate::manager::PersistenceManager;
use crate::persist;
use crate::worker::WorkerExecutor;

/// Top-level container: one virtual filesystem, one environment, one
/// persistence binding, one worker slot.
///
/// Execution is sequential per sandbox; the filesystem is shared by
/// every spawn while descriptor tables are per-spawn.
pub struct Sandbox {
    vfs: Vfs,
    env: SharedEnv,
    cwd: Arc<RwLock<String>>,
    adapter: Arc<PlatformAdapter>,
    pm: Arc<ProcessManager>,
    extensions: Arc<ExtensionRegistry>,
    fetcher: Option<Arc<dyn SyncFetcher>>,
    shell: ShellRunner,
    shell_location: String,
    worker: Option<WorkerExecutor>,
    persistence: Option<Arc<PersistenceManager>>,
    _bridge: Option<FetchBridge>,
    cancel: CancelToken,
    limits: Limits,
    timeout_ms: Option<u64>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("shell_location", &self.shell_location)
            .field("worker", &self.worker.is_some())
            .field("persistence", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

const DEFAULT_SHELL_LOCATION: &str = "shell.wasm";
const DEFAULT_PYTHON_LIB: &str = "/usr/lib/python";

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let vfs = Vfs::new();
        vfs.set_max_files(Some(config.limits.file_count));

        let env: SharedEnv = Arc::new(RwLock::new(IndexMap::new()));
        let cwd = Arc::new(RwLock::new("/home/user".to_string()));
        {
            let mut map = env.write();
            map.insert("HOME".to_string(), "/home/user".to_string());
            map.insert("PATH".to_string(), "/bin:/usr/bin".to_string());
            map.insert("PWD".to_string(), "/home/user".to_string());
            let mut python_path = config.python_path.clone();
            python_path.push(DEFAULT_PYTHON_LIB.to_string());
            map.insert("PYTHONPATH".to_string(), python_path.join(":"));
        }
        vfs.mount(
            "/proc",
            Arc::new(ProcProvider::new(env.clone(), cwd.clone())),
        )?;
        for mount in &config.mounts {
            let provider: Arc<dyn VirtualProvider> = match &mount.provider {
                Some(provider) => provider.clone(),
                None if mount.writable => Arc::new(HostMount::writable(mount.files.clone())),
                None => Arc::new(HostMount::new(mount.files.clone())),
            };
            vfs.mount(&mount.path, provider)?;
        }

        let shell_location = config
            .shell_wasm_path
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELL_LOCATION.to_string());

        let source = match &config.wasm_dir {
            Some(dir) => ModuleSource::Dir(dir.clone()),
            None => ModuleSource::Bundle(config.module_bundle.clone()),
        };
        let adapter = Arc::new(PlatformAdapter::new(source));
        let cancel = CancelToken::new();
        let pm = Arc::new(ProcessManager::new(
            adapter.clone(),
            Arc::new(vfs.clone()),
            config.limits,
            cancel.clone(),
        ));
        for location in tool_locations(&config)? {
            let name = location
                .strip_suffix(".wasm")
                .unwrap_or(&location)
                .to_string();
            if location != shell_location {
                pm.register_tool(&name, &location);
            }
        }

        let extensions = Arc::new(ExtensionRegistry::new());
        for extension in config.extensions {
            extensions.register(extension);
        }

        let (fetcher, bridge): (Option<Arc<dyn SyncFetcher>>, Option<FetchBridge>) =
            match config.network {
                Some(policy) => {
                    let gateway = Arc::new(NetworkGateway::new(policy));
                    if config.use_worker {
                        // Policy runs on this side of the worker boundary;
                        // the worker only ever sees the bridge client.
                        let bridge = FetchBridge::start(gateway);
                        (Some(Arc::new(bridge.client())), Some(bridge))
                    } else {
                        (Some(gateway), None)
                    }
                }
                None => (None, None),
            };

        let host = Arc::new(ShellHost::new(
            pm.clone(),
            extensions.clone(),
            fetcher.clone(),
            env.clone(),
            cwd.clone(),
        ));
        let shell = ShellRunner::new(shell_location.clone(), host);

        let worker = config.use_worker.then(|| {
            WorkerExecutor::new(
                vfs.clone(),
                adapter.clone(),
                pm.tools(),
                shell_location.clone(),
                config.limits,
                extensions.clone(),
                fetcher.clone(),
                env.clone(),
                cwd.clone(),
            )
        });

        let persistence = match config.persistence.mode {
            PersistenceMode::Ephemeral => None,
            _ => {
                let backend = config
                    .persistence
                    .backend
                    .clone()
                    .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
                match backend.load(&config.persistence.namespace) {
                    Ok(Some(bytes)) => match persist::import_state(&vfs, &bytes) {
                        Ok(saved_env) => {
                            let mut map = env.write();
                            for (key, value) in saved_env {
                                map.insert(key, value);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "ignoring unreadable persisted state")
                        }
                    },
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "persistence load failed"),
                }
                let source_vfs = vfs.clone();
                let source_env = env.clone();
                Some(Arc::new(PersistenceManager::new(
                    backend,
                    config.persistence.namespace.clone(),
                    config.persistence.autosave_ms,
                    Arc::new(move || {
                        let env_pairs: Vec<(String, String)> = source_env
                            .read()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        persist::export_state(&source_vfs, &env_pairs)
                    }),
                )))
            }
        };
        if let Some(manager) = &persistence {
            let manager = manager.clone();
            vfs.set_on_change(Some(Arc::new(move |_path| manager.mark_dirty())));
        }

        Ok(Sandbox {
            vfs,
            env,
            cwd,
            adapter,
            pm,
            extensions,
            fetcher,
            shell,
            shell_location,
            worker,
            persistence,
            _bridge: bridge,
            cancel,
            limits: config.limits,
            timeout_ms: config.timeout_ms,
        })
    }

    /// Run a shell command with the configured default deadline.
    pub fn run(&self, command: &str) -> RunResult {
        self.run_with_deadline(command, self.timeout_ms)
    }

    pub fn run_with_deadline(&self, command: &str, deadline_ms: Option<u64>) -> RunResult {
        match &self.worker {
            Some(worker) => worker.run(command, Vec::new(), deadline_ms),
            None => {
                // A previous kill only poisons the run it interrupted.
                self.cancel.reset();
                self.shell.run(command, deadline_ms)
            }
        }
    }

    /// Cancel whatever is running; the interrupted run reports exit 125.
    pub fn kill(&self) {
        self.cancel.cancel();
        if let Some(worker) = &self.worker {
            worker.kill();
        }
    }

    // --- filesystem surface ----------------------------------------------

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        Ok(self.vfs.read_file(path)?)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SandboxError> {
        Ok(self.vfs.write_file(path, data)?)
    }

    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        Ok(self.vfs.read_dir(path)?)
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, SandboxError> {
        Ok(self.vfs.stat(path)?)
    }

    pub fn mount_files(
        &self,
        path: &str,
        files: HashMap<String, Vec<u8>>,
    ) -> Result<(), SandboxError> {
        Ok(self.vfs.mount(path, Arc::new(HostMount::new(files)))?)
    }

    pub fn mount_provider(
        &self,
        path: &str,
        provider: Arc<dyn VirtualProvider>,
    ) -> Result<(), SandboxError> {
        Ok(self.vfs.mount(path, provider)?)
    }

    pub fn unmount(&self, path: &str) -> Result<(), SandboxError> {
        Ok(self.vfs.unmount(path)?)
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    // --- snapshots & forks -----------------------------------------------

    pub fn snapshot(&self) -> SnapshotId {
        self.vfs.snapshot()
    }

    pub fn restore(&self, id: SnapshotId) -> Result<(), SandboxError> {
        Ok(self.vfs.restore(id)?)
    }

    /// A fully isolated copy: forked filesystem, copied environment,
    /// shared module cache. The fork starts without persistence and
    /// without a worker.
    pub fn fork(&self) -> Result<Sandbox, SandboxError> {
        let vfs = self.vfs.fork();
        let env: SharedEnv = Arc::new(RwLock::new(self.env.read().clone()));
        let cwd = Arc::new(RwLock::new(self.cwd.read().clone()));
        // Mounted providers were forked with the tree, but the /proc
        // view still reflects the parent's environment; rebind it to
        // the fork's own copy.
        let _ = vfs.unmount("/proc");
        vfs.mount(
            "/proc",
            Arc::new(ProcProvider::new(env.clone(), cwd.clone())),
        )?;

        let cancel = CancelToken::new();
        let pm = Arc::new(ProcessManager::new(
            self.adapter.clone(),
            Arc::new(vfs.clone()),
            self.limits,
            cancel.clone(),
        ));
        for (name, location) in self.pm.tools() {
            pm.register_tool(&name, &location);
        }
        let host = Arc::new(ShellHost::new(
            pm.clone(),
            self.extensions.clone(),
            self.fetcher.clone(),
            env.clone(),
            cwd.clone(),
        ));
        let shell = ShellRunner::new(self.shell_location.clone(), host);

        Ok(Sandbox {
            vfs,
            env,
            cwd,
            adapter: self.adapter.clone(),
            pm,
            extensions: self.extensions.clone(),
            fetcher: self.fetcher.clone(),
            shell,
            shell_location: self.shell_location.clone(),
            worker: None,
            persistence: None,
            _bridge: None,
            cancel,
            limits: self.limits,
            timeout_ms: self.timeout_ms,
        })
    }

    // --- state & environment ---------------------------------------------

    pub fn export_state(&self) -> Vec<u8> {
        let env_pairs: Vec<(String, String)> = self
            .env
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        persist::export_state(&self.vfs, &env_pairs)
    }

    pub fn import_state(&self, bytes: &[u8]) -> Result<(), SandboxError> {
        let saved_env = persist::import_state(&self.vfs, bytes)?;
        let mut map = self.env.write();
        map.clear();
        for (key, value) in saved_env {
            map.insert(key, value);
        }
        Ok(())
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.env.read().get(name).cloned()
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.env
            .write()
            .insert(name.to_string(), value.to_string());
    }

    pub fn shell_host(&self) -> &Arc<ShellHost> {
        self.shell.host()
    }

    /// Flush pending persistence and stop background threads. Also runs
    /// on drop.
    pub fn dispose(&self) {
        self.vfs.set_on_change(None);
        if let Some(manager) = &self.persistence {
            manager.dispose();
        }
        if let Some(worker) = &self.worker {
            worker.kill();
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Tool module locations from the configured source: `*.wasm` files in
/// `wasm_dir`, or `*.wasm` keys of the bundle.
fn tool_locations(config: &SandboxConfig) -> Result<Vec<String>, SandboxError> {
    match &config.wasm_dir {
        Some(dir) => {
            let mut locations = Vec::new();
            let entries = std::fs::read_dir(dir)
                .map_err(|e| SandboxError::Module(format!("{}: {e}", dir.display())))?;
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".wasm") {
                    locations.push(name);
                }
            }
            locations.sort();
            Ok(locations)
        }
        None => {
            let mut locations: Vec<String> = config
                .module_bundle
                .keys()
                .filter(|k| k.ends_with(".wasm"))
                .cloned()
                .collect();
            locations.sort();
            Ok(locations)
        }
    }
}
