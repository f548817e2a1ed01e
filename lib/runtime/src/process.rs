use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use wasmer::{FunctionEnv, Instance, Store};

use wasmbox_vfs::FileSystem;
use wasmbox_wasi::{build_imports, CancelToken, ExitCode, Interrupt, WasiEnv};

use crate::adapter::PlatformAdapter;
use crate::limits::Limits;
use crate::result::{ErrorClass, Truncated, EXIT_CANCELLED, EXIT_NOT_FOUND, EXIT_TIMEOUT};

/// Options for one spawn. `args` is `argv[1..]`; the tool name becomes
/// `argv[0]`.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    pub cwd: String,
    pub deadline_ms: Option<u64>,
}

/// Raw result of a spawn, stdio as captured bytes.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: Truncated,
    pub error_class: Option<ErrorClass>,
    pub execution_time_ms: u64,
}

impl SpawnOutcome {
    fn failure(
        exit_code: i32,
        message: impl Into<String>,
        error_class: Option<ErrorClass>,
        started: Instant,
    ) -> Self {
        let mut stderr = message.into().into_bytes();
        if !stderr.is_empty() && stderr.last() != Some(&b'\n') {
            stderr.push(b'\n');
        }
        SpawnOutcome {
            exit_code,
            stdout: Vec::new(),
            stderr,
            truncated: Truncated::default(),
            error_class,
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Tool registry plus the spawn path: one compiled module, one fresh
/// store and WASI host per invocation, run to completion on the calling
/// thread.
#[derive(Debug)]
pub struct ProcessManager {
    adapter: Arc<PlatformAdapter>,
    tools: DashMap<String, String>,
    fs: Arc<dyn FileSystem>,
    limits: Limits,
    cancel: CancelToken,
}

impl ProcessManager {
    pub fn new(
        adapter: Arc<PlatformAdapter>,
        fs: Arc<dyn FileSystem>,
        limits: Limits,
        cancel: CancelToken,
    ) -> Self {
        ProcessManager {
            adapter,
            tools: DashMap::new(),
            fs,
            limits,
            cancel,
        }
    }

    pub fn register_tool(&self, name: &str, location: &str) {
        self.tools.insert(name.to_string(), location.to_string());
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.key().clone()).collect()
    }

    /// `(name, location)` pairs, used to mirror the registry into a
    /// worker-side manager.
    pub fn tools(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn fs(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn adapter(&self) -> Arc<PlatformAdapter> {
        self.adapter.clone()
    }

    /// Run a registered tool to completion. Failures are encoded in the
    /// outcome, never raised: a missing tool is 127, a timeout is 124,
    /// a cancellation is 125, a trap is 127 with the message on stderr.
    pub fn spawn(&self, name: &str, opts: SpawnOptions) -> SpawnOutcome {
        let started = Instant::now();
        if self.cancel.is_cancelled() {
            return SpawnOutcome::failure(
                EXIT_CANCELLED,
                "",
                Some(ErrorClass::Cancelled),
                started,
            );
        }
        let location = match self.tools.get(name) {
            Some(loc) => loc.clone(),
            None => {
                return SpawnOutcome::failure(
                    EXIT_NOT_FOUND,
                    format!("{name}: command not found"),
                    None,
                    started,
                )
            }
        };
        let module = match self.adapter.load(&location) {
            Ok(m) => m,
            Err(err) => {
                return SpawnOutcome::failure(EXIT_NOT_FOUND, err.to_string(), None, started)
            }
        };

        let mut store = Store::new(self.adapter.engine().clone());
        let deadline = opts
            .deadline_ms
            .map(|ms| started + Duration::from_millis(ms));
        let argv: Vec<String> = std::iter::once(name.to_string())
            .chain(opts.args.into_iter())
            .collect();
        let cwd = if opts.cwd.is_empty() {
            "/".to_string()
        } else {
            opts.cwd
        };
        tracing::debug!(tool = name, ?deadline, "spawn");

        let mut wasi = WasiEnv::new(
            self.fs.clone(),
            argv,
            opts.env,
            cwd,
            opts.stdin,
            self.limits.stdout_bytes,
            deadline,
            self.cancel.clone(),
        );
        wasi.set_stderr_limit(self.limits.stderr_bytes);
        let env = FunctionEnv::new(&mut store, wasi);
        let imports = build_imports(&mut store, &env);

        let instance = match Instance::new(&mut store, &module, &imports) {
            Ok(instance) => instance,
            Err(err) => {
                return SpawnOutcome::failure(
                    EXIT_NOT_FOUND,
                    format!("{name}: instantiation failed: {err}"),
                    None,
                    started,
                )
            }
        };
        match instance.exports.get_memory("memory") {
            Ok(memory) => env.as_mut(&mut store).memory = Some(memory.clone()),
            Err(_) => {
                return SpawnOutcome::failure(
                    EXIT_NOT_FOUND,
                    format!("{name}: module exports no memory"),
                    None,
                    started,
                )
            }
        }

        if let Ok(init) = instance.exports.get_function("_initialize") {
            if let Err(err) = init.call(&mut store, &[]) {
                let (code, class, trap) = classify(err);
                let ((stdout, out_trunc), (stderr, err_trunc)) =
                    env.as_mut(&mut store).take_outputs();
                return finish(
                    code, class, trap, stdout, stderr, out_trunc, err_trunc, started,
                );
            }
        }

        let start_fn = match instance.exports.get_function("_start") {
            Ok(f) => f.clone(),
            Err(_) => {
                return SpawnOutcome::failure(
                    EXIT_NOT_FOUND,
                    format!("{name}: module exports no _start"),
                    None,
                    started,
                )
            }
        };

        let (exit_code, error_class, trap_message) = match start_fn.call(&mut store, &[]) {
            Ok(_) => (0, None, None),
            Err(err) => classify(err),
        };
        let ((stdout, out_trunc), (stderr, err_trunc)) = env.as_mut(&mut store).take_outputs();
        finish(
            exit_code,
            error_class,
            trap_message,
            stdout,
            stderr,
            out_trunc,
            err_trunc,
            started,
        )
    }

    /// String-shaped spawn used by the guest shell's `host_spawn`.
    pub fn spawn_sync(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
        stdin: &[u8],
        cwd: &str,
        deadline_ms: Option<u64>,
    ) -> SpawnOutcome {
        self.spawn(
            program,
            SpawnOptions {
                args: args.to_vec(),
                env: env.to_vec(),
                stdin: stdin.to_vec(),
                cwd: cwd.to_string(),
                deadline_ms,
            },
        )
    }
}

pub(crate) fn classify(err: wasmer::RuntimeError) -> (i32, Option<ErrorClass>, Option<String>) {
    match err.downcast::<ExitCode>() {
        Ok(ExitCode(code)) => (code, None, None),
        Err(err) => match err.downcast::<Interrupt>() {
            Ok(Interrupt::Timeout) => (EXIT_TIMEOUT, Some(ErrorClass::Timeout), None),
            Ok(Interrupt::Cancelled) => (EXIT_CANCELLED, Some(ErrorClass::Cancelled), None),
            Err(err) => (EXIT_NOT_FOUND, None, Some(err.message())),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    exit_code: i32,
    error_class: Option<ErrorClass>,
    trap_message: Option<String>,
    stdout: Vec<u8>,
    mut stderr: Vec<u8>,
    stdout_truncated: bool,
    stderr_truncated: bool,
    started: Instant,
) -> SpawnOutcome {
    if let Some(message) = trap_message {
        stderr.extend_from_slice(message.as_bytes());
        stderr.push(b'\n');
    }
    SpawnOutcome {
        exit_code,
        stdout,
        stderr,
        truncated: Truncated {
            stdout: stdout_truncated,
            stderr: stderr_truncated,
        },
        error_class,
        execution_time_ms: started.elapsed().as_millis() as u64,
    }
}
