//! Off-thread execution.
//!
//! The worker thread owns its own process manager and shell runner over
//! a [`crate::proxy::VfsProxy`]; the real tree stays on the spawning
//! side, serviced by a dedicated proxy thread. "Termination" is
//! cooperative: killing a worker flips its cancel token and poisons the
//! proxy channel, so the guest unwinds at its next host import while
//! the caller gets its result immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use wasmbox_net::SyncFetcher;
use wasmbox_runtime::{
    ExtensionRegistry, Limits, PlatformAdapter, ProcessManager, RunResult, ShellHost,
    ShellRunner, EXIT_NOT_FOUND,
};
use wasmbox_vfs::{FileSystem, SharedEnv, Vfs};
use wasmbox_wasi::CancelToken;

use crate::proxy::{serve_vfs, ProxyChannel, VfsProxy};

/// Grace period past the deadline before the main side gives up on the
/// worker and retires it.
const DEADLINE_GRACE: Duration = Duration::from_millis(500);

enum WorkerMsg {
    Run {
        command: String,
        env: Vec<(String, String)>,
        deadline_ms: Option<u64>,
    },
}

struct WorkerHandle {
    cmd_tx: mpsc::Sender<WorkerMsg>,
    res_rx: mpsc::Receiver<RunResult>,
}

#[derive(Clone)]
struct WorkerControls {
    cancel: CancelToken,
    channel: Arc<ProxyChannel>,
    killed: Arc<AtomicBool>,
}

pub struct WorkerExecutor {
    vfs: Vfs,
    adapter: Arc<PlatformAdapter>,
    tools: Vec<(String, String)>,
    shell_location: String,
    limits: Limits,
    extensions: Arc<ExtensionRegistry>,
    fetcher: Option<Arc<dyn SyncFetcher>>,
    env: SharedEnv,
    cwd: Arc<RwLock<String>>,
    handle: Mutex<Option<WorkerHandle>>,
    controls: Mutex<Option<WorkerControls>>,
}

impl fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("shell_location", &self.shell_location)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl WorkerExecutor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vfs: Vfs,
        adapter: Arc<PlatformAdapter>,
        tools: Vec<(String, String)>,
        shell_location: String,
        limits: Limits,
        extensions: Arc<ExtensionRegistry>,
        fetcher: Option<Arc<dyn SyncFetcher>>,
        env: SharedEnv,
        cwd: Arc<RwLock<String>>,
    ) -> Self {
        WorkerExecutor {
            vfs,
            adapter,
            tools,
            shell_location,
            limits,
            extensions,
            fetcher,
            env,
            cwd,
            handle: Mutex::new(None),
            controls: Mutex::new(None),
        }
    }

    fn spawn_worker(&self) -> (WorkerHandle, WorkerControls) {
        let channel = Arc::new(ProxyChannel::default());
        let controls = WorkerControls {
            cancel: CancelToken::new(),
            channel: channel.clone(),
            killed: Arc::new(AtomicBool::new(false)),
        };

        let service_channel = channel.clone();
        let service_fs: Arc<dyn FileSystem> = Arc::new(self.vfs.clone());
        std::thread::Builder::new()
            .name("wasmbox-vfs-service".to_string())
            .spawn(move || serve_vfs(service_channel, service_fs))
            .expect("spawn vfs service thread");

        let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerMsg>();
        let (res_tx, res_rx) = mpsc::channel::<RunResult>();

        let adapter = self.adapter.clone();
        let tools = self.tools.clone();
        let shell_location = self.shell_location.clone();
        let limits = self.limits;
        let extensions = self.extensions.clone();
        let fetcher = self.fetcher.clone();
        let env = self.env.clone();
        let cwd = self.cwd.clone();
        let cancel = controls.cancel.clone();
        let killed = controls.killed.clone();

        std::thread::Builder::new()
            .name("wasmbox-worker".to_string())
            .spawn(move || {
                let proxy: Arc<dyn FileSystem> = Arc::new(VfsProxy::new(channel));
                let pm = Arc::new(ProcessManager::new(adapter, proxy, limits, cancel));
                for (name, location) in &tools {
                    pm.register_tool(name, location);
                }
                let host = Arc::new(ShellHost::new(
                    pm,
                    extensions,
                    fetcher,
                    env.clone(),
                    cwd,
                ));
                let runner = ShellRunner::new(shell_location, host);
                while let Ok(WorkerMsg::Run {
                    command,
                    env: overrides,
                    deadline_ms,
                }) = cmd_rx.recv()
                {
                    if killed.load(Ordering::SeqCst) {
                        break;
                    }
                    for (key, value) in overrides {
                        env.write().insert(key, value);
                    }
                    let result = runner.run(&command, deadline_ms);
                    if res_tx.send(result).is_err() {
                        break;
                    }
                    if killed.load(Ordering::SeqCst) {
                        break;
                    }
                }
            })
            .expect("spawn worker thread");

        (WorkerHandle { cmd_tx, res_rx }, controls)
    }

    /// Run a command on the worker, spawning one if needed. A deadline
    /// is enforced twice: cooperatively inside the guest, and by a
    /// main-side timer that retires an unresponsive worker.
    pub fn run(
        &self,
        command: &str,
        env: Vec<(String, String)>,
        deadline_ms: Option<u64>,
    ) -> RunResult {
        let mut guard = self.handle.lock();
        let stale = self
            .controls
            .lock()
            .as_ref()
            .map_or(true, |c| c.killed.load(Ordering::SeqCst));
        if guard.is_none() || stale {
            *guard = None;
            let (handle, controls) = self.spawn_worker();
            *guard = Some(handle);
            *self.controls.lock() = Some(controls);
        }
        let controls = self
            .controls
            .lock()
            .as_ref()
            .expect("controls set with handle")
            .clone();

        let message = WorkerMsg::Run {
            command: command.to_string(),
            env,
            deadline_ms,
        };
        let handle = guard.as_mut().expect("handle ensured above");
        if handle.cmd_tx.send(message).is_err() {
            *guard = None;
            return worker_lost();
        }

        let result = match deadline_ms {
            Some(ms) => match handle
                .res_rx
                .recv_timeout(Duration::from_millis(ms) + DEADLINE_GRACE)
            {
                Ok(result) => result,
                Err(_) => {
                    // The guest ignored its deadline; retire the worker.
                    controls.cancel.cancel();
                    controls.killed.store(true, Ordering::SeqCst);
                    controls.channel.shutdown();
                    *guard = None;
                    *self.controls.lock() = None;
                    return RunResult::timeout(ms);
                }
            },
            None => match handle.res_rx.recv() {
                Ok(result) => result,
                Err(_) => {
                    *guard = None;
                    return worker_lost();
                }
            },
        };
        if controls.killed.load(Ordering::SeqCst) {
            *guard = None;
            *self.controls.lock() = None;
        }
        result
    }

    /// Cancel the in-flight run (it resolves with exit 125) and retire
    /// the worker; the next `run` spawns a fresh one.
    pub fn kill(&self) {
        let controls = self.controls.lock().clone();
        if let Some(controls) = controls {
            tracing::debug!("killing worker");
            controls.killed.store(true, Ordering::SeqCst);
            controls.cancel.cancel();
            controls.channel.shutdown();
        }
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        self.kill();
        *self.handle.lock() = None;
    }
}

fn worker_lost() -> RunResult {
    RunResult {
        exit_code: EXIT_NOT_FOUND,
        stdout: String::new(),
        stderr: "worker terminated unexpectedly\n".to_string(),
        execution_time_ms: 0,
        truncated: None,
        error_class: None,
    }
}
