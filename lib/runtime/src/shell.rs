//! Host side of the guest-shell bridge.
//!
//! The shell itself is a `.wasm` guest exporting `alloc` and
//! `run_command`; it parses pipelines and calls back into the host
//! through the `wasmbox` import namespace. Requests are JSON, responses
//! go through a caller-allocated output buffer: a negative return is an
//! error code, a return larger than the capacity asks the guest to
//! retry with that many bytes (the oversized response is stashed so the
//! retry does not re-execute the operation).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use wasmer::{
    imports, Function, FunctionEnv, FunctionEnvMut, Imports, Instance, Memory, RuntimeError,
    Store,
};

use wasmbox_net::{FetchRequest, SyncFetcher};
use wasmbox_vfs::{path as vpath, FileSystem, FsError, SharedEnv};
use wasmbox_wasi::{build_imports, Interrupt, WasiEnv};

use crate::extensions::{ExtensionError, ExtensionRegistry, ExtensionRequest};
use crate::glob::glob_walk;
use crate::process::ProcessManager;
use crate::result::{ErrorClass, RunResult, Truncated, EXIT_NOT_FOUND};

const RC_NOT_FOUND: i32 = -1;
const RC_PERMISSION: i32 = -2;
const RC_IO: i32 = -3;

fn rc_of(err: &FsError) -> i32 {
    match err {
        FsError::EntryNotFound => RC_NOT_FOUND,
        FsError::ReadOnly => RC_PERMISSION,
        _ => RC_IO,
    }
}

/// Spawn request a shell guest sends through `host_spawn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub stdin: String,
}

fn default_cwd() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatInfo {
    pub exists: bool,
    pub is_file: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
}

/// Fetch request a shell guest sends through `host_fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchCall {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchReply {
    pub ok: bool,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtensionInvokeWire {
    name: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    stdin: String,
    #[serde(default)]
    env: Vec<(String, String)>,
    #[serde(default = "default_cwd")]
    cwd: String,
}

/// Host-side state behind the shell imports: the canonical environment
/// map, command history, working directory, and handles to the process
/// manager, extensions and network.
pub struct ShellHost {
    pm: Arc<ProcessManager>,
    extensions: Arc<ExtensionRegistry>,
    fetcher: Option<Arc<dyn SyncFetcher>>,
    env: SharedEnv,
    cwd: Arc<RwLock<String>>,
    history: Mutex<Vec<String>>,
    deadline: RwLock<Option<Instant>>,
}

impl fmt::Debug for ShellHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellHost")
            .field("cwd", &*self.cwd.read())
            .finish_non_exhaustive()
    }
}

impl ShellHost {
    pub fn new(
        pm: Arc<ProcessManager>,
        extensions: Arc<ExtensionRegistry>,
        fetcher: Option<Arc<dyn SyncFetcher>>,
        env: SharedEnv,
        cwd: Arc<RwLock<String>>,
    ) -> Self {
        ShellHost {
            pm,
            extensions,
            fetcher,
            env,
            cwd,
            history: Mutex::new(Vec::new()),
            deadline: RwLock::new(None),
        }
    }

    pub fn pm(&self) -> Arc<ProcessManager> {
        self.pm.clone()
    }

    pub fn env_snapshot(&self) -> Vec<(String, String)> {
        self.env
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn cwd_string(&self) -> String {
        self.cwd.read().clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.write() = deadline;
    }

    fn remaining_ms(&self) -> Option<u64> {
        self.deadline
            .read()
            .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64)
    }

    fn abs(&self, path: &str) -> String {
        vpath::join(&self.cwd_string(), path)
    }

    // --- handlers, exercised directly by tests and by the wasm glue ---

    pub fn spawn(&self, req: SpawnRequest) -> SpawnResult {
        if self.extensions.is_extension(&req.program) {
            return match self.extensions.invoke(
                &req.program,
                ExtensionRequest {
                    args: req.args.clone(),
                    stdin: req.stdin.clone(),
                    env: req.env.clone(),
                    cwd: req.cwd.clone(),
                },
            ) {
                Ok(out) => SpawnResult {
                    exit_code: out.exit_code,
                    stdout: out.stdout,
                    stderr: out.stderr,
                },
                Err(err) => SpawnResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("{err}\n"),
                },
            };
        }
        let outcome = self.pm.spawn_sync(
            &req.program,
            &req.args,
            &req.env,
            req.stdin.as_bytes(),
            &req.cwd,
            self.remaining_ms(),
        );
        SpawnResult {
            exit_code: outcome.exit_code,
            stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.pm.has_tool(name)
    }

    pub fn is_extension(&self, name: &str) -> bool {
        self.extensions.is_extension(name)
    }

    /// 0 = running, 1 = cancelled, 2 = timed out.
    pub fn check_cancel(&self) -> i32 {
        if self.pm.cancel_token().is_cancelled() {
            return 1;
        }
        if let Some(deadline) = *self.deadline.read() {
            if Instant::now() >= deadline {
                return 2;
            }
        }
        0
    }

    pub fn time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn stat(&self, path: &str) -> Result<StatInfo, FsError> {
        let fs = self.pm.fs();
        let abs = self.abs(path);
        match fs.lstat(&abs) {
            Ok(lstat) => {
                let followed = if lstat.is_symlink() {
                    fs.stat(&abs).ok()
                } else {
                    None
                };
                let effective = followed.unwrap_or(lstat);
                Ok(StatInfo {
                    exists: true,
                    is_file: effective.is_file(),
                    is_dir: effective.is_dir(),
                    is_symlink: lstat.is_symlink(),
                    size: effective.size,
                    mode: effective.mode,
                    mtime_ms: effective.mtime,
                })
            }
            Err(FsError::EntryNotFound) => Ok(StatInfo {
                exists: false,
                is_file: false,
                is_dir: false,
                is_symlink: false,
                size: 0,
                mode: 0,
                mtime_ms: 0,
            }),
            Err(err) => Err(err),
        }
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.pm.fs().read_file(&self.abs(path))
    }

    pub fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        let fs = self.pm.fs();
        let abs = self.abs(path);
        if append {
            fs.append_file(&abs, data)
        } else {
            fs.write_file(&abs, data)
        }
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        Ok(self
            .pm
            .fs()
            .read_dir(&self.abs(path))?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        self.pm.fs().mkdirp(&self.abs(path))
    }

    pub fn remove(&self, path: &str, recursive: bool) -> Result<(), FsError> {
        let fs = self.pm.fs();
        let abs = self.abs(path);
        let stat = fs.lstat(&abs)?;
        if stat.is_dir() {
            if recursive {
                remove_tree(fs.as_ref(), &abs)
            } else {
                fs.rmdir(&abs)
            }
        } else {
            fs.unlink(&abs)
        }
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.pm.fs().chmod(&self.abs(path), mode)
    }

    pub fn glob(&self, pattern: &str) -> Vec<String> {
        glob_walk(self.pm.fs().as_ref(), pattern, &self.cwd_string())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.pm.fs().rename(&self.abs(from), &self.abs(to))
    }

    pub fn symlink(&self, target: &str, link: &str) -> Result<(), FsError> {
        self.pm.fs().symlink(target, &self.abs(link))
    }

    pub fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.pm.fs().read_link(&self.abs(path))
    }

    pub fn fetch(&self, wire: FetchCall) -> FetchReply {
        let Some(fetcher) = &self.fetcher else {
            return FetchReply {
                ok: false,
                status: 0,
                headers: Vec::new(),
                body: String::new(),
                error: Some(
                    "networking disabled: configure a network policy to enable".to_string(),
                ),
            };
        };
        let response = fetcher.fetch_sync(&FetchRequest {
            url: wire.url,
            method: wire.method,
            headers: wire.headers,
            body: wire.body.map(|b| b.into_bytes()),
        });
        FetchReply {
            ok: response.ok,
            status: response.status,
            headers: response.headers,
            body: String::from_utf8_lossy(&response.body).into_owned(),
            error: response.error,
        }
    }

    fn extension_invoke(&self, wire: ExtensionInvokeWire) -> Result<SpawnResult, ExtensionError> {
        let out = self.extensions.invoke(
            &wire.name,
            ExtensionRequest {
                args: wire.args,
                stdin: wire.stdin,
                env: wire.env,
                cwd: wire.cwd,
            },
        )?;
        Ok(SpawnResult {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    pub fn register_tool(&self, name: &str, location: &str) {
        self.pm.register_tool(name, location);
    }

    pub fn env_get(&self, name: &str) -> Option<String> {
        self.env.read().get(name).cloned()
    }

    pub fn env_set(&self, name: &str, value: &str) {
        self.env.write().insert(name.to_string(), value.to_string());
    }

    pub fn history_push(&self, command: &str) {
        self.history.lock().push(command.to_string());
    }
}

fn remove_tree(fs: &dyn FileSystem, path: &str) -> Result<(), FsError> {
    for entry in fs.read_dir(path)? {
        let child = vpath::join(path, &entry.name);
        match fs.lstat(&child)? {
            stat if stat.is_dir() => remove_tree(fs, &child)?,
            _ => fs.unlink(&child)?,
        }
    }
    fs.rmdir(path)
}

// --- wasm glue -----------------------------------------------------------

struct ShellEnv {
    host: Arc<ShellHost>,
    memory: Option<Memory>,
    /// Response that exceeded the guest's buffer, kept for the retry.
    stash: Option<(&'static str, Vec<u8>)>,
    rpc_limit: usize,
}

/// Cancellation and deadline are observed on entry to every shell
/// import; `host_check_cancel` stays non-trapping so a guest can poll.
fn guard(ctx: &FunctionEnvMut<ShellEnv>) -> Result<(), RuntimeError> {
    match ctx.data().host.check_cancel() {
        1 => Err(RuntimeError::user(Box::new(Interrupt::Cancelled))),
        2 => Err(RuntimeError::user(Box::new(Interrupt::Timeout))),
        _ => Ok(()),
    }
}

fn with_outbuf(
    mut ctx: FunctionEnvMut<ShellEnv>,
    op: &'static str,
    input: Option<(u32, u32)>,
    out_ptr: u32,
    out_cap: u32,
    f: impl FnOnce(&ShellHost, Vec<u8>) -> Result<Vec<u8>, i32>,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let (env, store) = ctx.data_and_store_mut();
    let memory = match &env.memory {
        Some(m) => m.clone(),
        None => return Ok(RC_IO),
    };
    let view = memory.view(&store);

    let stashed = match env.stash.take() {
        Some((stash_op, bytes)) if stash_op == op => Some(bytes),
        other => {
            env.stash = other;
            None
        }
    };
    let payload = match stashed {
        Some(bytes) => bytes,
        None => {
            let request = match input {
                Some((ptr, len)) => {
                    if len as usize > env.rpc_limit {
                        return Ok(RC_IO);
                    }
                    let mut buf = vec![0u8; len as usize];
                    if view.read(ptr as u64, &mut buf).is_err() {
                        return Ok(RC_IO);
                    }
                    buf
                }
                None => Vec::new(),
            };
            let host = env.host.clone();
            match f(&host, request) {
                Ok(payload) => payload,
                Err(rc) => return Ok(rc),
            }
        }
    };

    if payload.len() > out_cap as usize {
        let len = payload.len() as i32;
        env.stash = Some((op, payload));
        return Ok(len);
    }
    if view.write(out_ptr as u64, &payload).is_err() {
        return Ok(RC_IO);
    }
    Ok(payload.len() as i32)
}

fn read_guest_str(ctx: &mut FunctionEnvMut<ShellEnv>, ptr: u32, len: u32) -> Option<String> {
    let (env, store) = ctx.data_and_store_mut();
    let memory = env.memory.clone()?;
    let view = memory.view(&store);
    let mut buf = vec![0u8; len as usize];
    view.read(ptr as u64, &mut buf).ok()?;
    String::from_utf8(buf).ok()
}

fn host_spawn(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "spawn", Some((p, l)), out, cap, |host, req| {
        let req: SpawnRequest = serde_json::from_slice(&req).map_err(|_| RC_IO)?;
        serde_json::to_vec(&host.spawn(req)).map_err(|_| RC_IO)
    })
}

fn host_has_tool(mut ctx: FunctionEnvMut<ShellEnv>, p: u32, l: u32) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    Ok(match read_guest_str(&mut ctx, p, l) {
        Some(name) => ctx.data().host.has_tool(&name) as i32,
        None => 0,
    })
}

fn host_is_extension(
    mut ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    Ok(match read_guest_str(&mut ctx, p, l) {
        Some(name) => ctx.data().host.is_extension(&name) as i32,
        None => 0,
    })
}

fn host_check_cancel(ctx: FunctionEnvMut<ShellEnv>) -> i32 {
    ctx.data().host.check_cancel()
}

fn host_time_ms(ctx: FunctionEnvMut<ShellEnv>) -> Result<u64, RuntimeError> {
    guard(&ctx)?;
    Ok(ctx.data().host.time_ms())
}

fn host_stat(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "stat", Some((p, l)), out, cap, |host, req| {
        let path = String::from_utf8(req).map_err(|_| RC_IO)?;
        let info = host.stat(&path).map_err(|e| rc_of(&e))?;
        serde_json::to_vec(&info).map_err(|_| RC_IO)
    })
}

fn host_read_file(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "read_file", Some((p, l)), out, cap, |host, req| {
        let path = String::from_utf8(req).map_err(|_| RC_IO)?;
        host.read_file(&path).map_err(|e| rc_of(&e))
    })
}

fn host_write_file(
    mut ctx: FunctionEnvMut<ShellEnv>,
    path_ptr: u32,
    path_len: u32,
    data_ptr: u32,
    data_len: u32,
    mode: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let Some(path) = read_guest_str(&mut ctx, path_ptr, path_len) else {
        return Ok(RC_IO);
    };
    let data = {
        let (env, store) = ctx.data_and_store_mut();
        let Some(memory) = env.memory.clone() else {
            return Ok(RC_IO);
        };
        if data_len as usize > env.rpc_limit {
            return Ok(RC_IO);
        }
        let mut buf = vec![0u8; data_len as usize];
        if memory.view(&store).read(data_ptr as u64, &mut buf).is_err() {
            return Ok(RC_IO);
        }
        buf
    };
    Ok(match ctx.data().host.write_file(&path, &data, mode == 1) {
        Ok(()) => 0,
        Err(err) => rc_of(&err),
    })
}

fn host_readdir(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "readdir", Some((p, l)), out, cap, |host, req| {
        let path = String::from_utf8(req).map_err(|_| RC_IO)?;
        let names = host.readdir(&path).map_err(|e| rc_of(&e))?;
        serde_json::to_vec(&names).map_err(|_| RC_IO)
    })
}

fn host_mkdir(mut ctx: FunctionEnvMut<ShellEnv>, p: u32, l: u32) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let Some(path) = read_guest_str(&mut ctx, p, l) else {
        return Ok(RC_IO);
    };
    Ok(match ctx.data().host.mkdir(&path) {
        Ok(()) => 0,
        Err(err) => rc_of(&err),
    })
}

fn host_remove(
    mut ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    recursive: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let Some(path) = read_guest_str(&mut ctx, p, l) else {
        return Ok(RC_IO);
    };
    Ok(match ctx.data().host.remove(&path, recursive == 1) {
        Ok(()) => 0,
        Err(err) => rc_of(&err),
    })
}

fn host_chmod(
    mut ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    mode: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let Some(path) = read_guest_str(&mut ctx, p, l) else {
        return Ok(RC_IO);
    };
    Ok(match ctx.data().host.chmod(&path, mode) {
        Ok(()) => 0,
        Err(err) => rc_of(&err),
    })
}

fn host_glob(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "glob", Some((p, l)), out, cap, |host, req| {
        let pattern = String::from_utf8(req).map_err(|_| RC_IO)?;
        serde_json::to_vec(&host.glob(&pattern)).map_err(|_| RC_IO)
    })
}

fn host_rename(
    mut ctx: FunctionEnvMut<ShellEnv>,
    from_ptr: u32,
    from_len: u32,
    to_ptr: u32,
    to_len: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let (Some(from), Some(to)) = (
        read_guest_str(&mut ctx, from_ptr, from_len),
        read_guest_str(&mut ctx, to_ptr, to_len),
    ) else {
        return Ok(RC_IO);
    };
    Ok(match ctx.data().host.rename(&from, &to) {
        Ok(()) => 0,
        Err(err) => rc_of(&err),
    })
}

fn host_symlink(
    mut ctx: FunctionEnvMut<ShellEnv>,
    target_ptr: u32,
    target_len: u32,
    link_ptr: u32,
    link_len: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let (Some(target), Some(link)) = (
        read_guest_str(&mut ctx, target_ptr, target_len),
        read_guest_str(&mut ctx, link_ptr, link_len),
    ) else {
        return Ok(RC_IO);
    };
    Ok(match ctx.data().host.symlink(&target, &link) {
        Ok(()) => 0,
        Err(err) => rc_of(&err),
    })
}

fn host_readlink(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "readlink", Some((p, l)), out, cap, |host, req| {
        let path = String::from_utf8(req).map_err(|_| RC_IO)?;
        host.readlink(&path)
            .map(String::into_bytes)
            .map_err(|e| rc_of(&e))
    })
}

fn host_fetch(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "fetch", Some((p, l)), out, cap, |host, req| {
        let wire: FetchCall = serde_json::from_slice(&req).map_err(|_| RC_IO)?;
        serde_json::to_vec(&host.fetch(wire)).map_err(|_| RC_IO)
    })
}

fn host_extension_invoke(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "extension_invoke", Some((p, l)), out, cap, |host, req| {
        let wire: ExtensionInvokeWire = serde_json::from_slice(&req).map_err(|_| RC_IO)?;
        let result = host.extension_invoke(wire).map_err(|err| match err {
            ExtensionError::NotFound(_) => RC_NOT_FOUND,
            ExtensionError::HandlerError(_) => RC_IO,
        })?;
        serde_json::to_vec(&result).map_err(|_| RC_IO)
    })
}

fn host_register_tool(
    mut ctx: FunctionEnvMut<ShellEnv>,
    name_ptr: u32,
    name_len: u32,
    path_ptr: u32,
    path_len: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let (Some(name), Some(location)) = (
        read_guest_str(&mut ctx, name_ptr, name_len),
        read_guest_str(&mut ctx, path_ptr, path_len),
    ) else {
        return Ok(RC_IO);
    };
    ctx.data().host.register_tool(&name, &location);
    Ok(0)
}

fn host_env_get(
    ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
    out: u32,
    cap: u32,
) -> Result<i32, RuntimeError> {
    with_outbuf(ctx, "env_get", Some((p, l)), out, cap, |host, req| {
        let name = String::from_utf8(req).map_err(|_| RC_IO)?;
        host.env_get(&name)
            .map(String::into_bytes)
            .ok_or(RC_NOT_FOUND)
    })
}

fn host_env_set(
    mut ctx: FunctionEnvMut<ShellEnv>,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let (Some(name), Some(value)) = (
        read_guest_str(&mut ctx, name_ptr, name_len),
        read_guest_str(&mut ctx, value_ptr, value_len),
    ) else {
        return Ok(RC_IO);
    };
    ctx.data().host.env_set(&name, &value);
    Ok(0)
}

fn host_history_push(
    mut ctx: FunctionEnvMut<ShellEnv>,
    p: u32,
    l: u32,
) -> Result<i32, RuntimeError> {
    guard(&ctx)?;
    let Some(command) = read_guest_str(&mut ctx, p, l) else {
        return Ok(RC_IO);
    };
    ctx.data().host.history_push(&command);
    Ok(0)
}

fn build_shell_imports(store: &mut Store, env: &FunctionEnv<ShellEnv>) -> Imports {
    imports! {
        "wasmbox" => {
            "host_spawn" => Function::new_typed_with_env(store, env, host_spawn),
            "host_has_tool" => Function::new_typed_with_env(store, env, host_has_tool),
            "host_is_extension" => Function::new_typed_with_env(store, env, host_is_extension),
            "host_check_cancel" => Function::new_typed_with_env(store, env, host_check_cancel),
            "host_time_ms" => Function::new_typed_with_env(store, env, host_time_ms),
            "host_stat" => Function::new_typed_with_env(store, env, host_stat),
            "host_read_file" => Function::new_typed_with_env(store, env, host_read_file),
            "host_write_file" => Function::new_typed_with_env(store, env, host_write_file),
            "host_readdir" => Function::new_typed_with_env(store, env, host_readdir),
            "host_mkdir" => Function::new_typed_with_env(store, env, host_mkdir),
            "host_remove" => Function::new_typed_with_env(store, env, host_remove),
            "host_chmod" => Function::new_typed_with_env(store, env, host_chmod),
            "host_glob" => Function::new_typed_with_env(store, env, host_glob),
            "host_rename" => Function::new_typed_with_env(store, env, host_rename),
            "host_symlink" => Function::new_typed_with_env(store, env, host_symlink),
            "host_readlink" => Function::new_typed_with_env(store, env, host_readlink),
            "host_fetch" => Function::new_typed_with_env(store, env, host_fetch),
            "host_extension_invoke" => Function::new_typed_with_env(store, env, host_extension_invoke),
            // Older shell builds import the same entry point under its
            // short name.
            "extension_call" => Function::new_typed_with_env(store, env, host_extension_invoke),
            "host_register_tool" => Function::new_typed_with_env(store, env, host_register_tool),
            "host_env_get" => Function::new_typed_with_env(store, env, host_env_get),
            "host_env_set" => Function::new_typed_with_env(store, env, host_env_set),
            "host_history_push" => Function::new_typed_with_env(store, env, host_history_push),
        }
    }
}

// --- runner --------------------------------------------------------------

struct ShellSession {
    store: Store,
    instance: Instance,
    wasi_env: FunctionEnv<WasiEnv>,
}

/// Drives the shell-parser guest: writes the command into guest memory,
/// calls `run_command`, and reports the shell's captured stdio as the
/// pipeline result. The instance is reused across runs and rebuilt
/// after any abnormal unwind.
pub struct ShellRunner {
    shell_location: String,
    host: Arc<ShellHost>,
    session: Mutex<Option<ShellSession>>,
}

impl fmt::Debug for ShellRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellRunner")
            .field("shell_location", &self.shell_location)
            .finish_non_exhaustive()
    }
}

impl ShellRunner {
    pub fn new(shell_location: impl Into<String>, host: Arc<ShellHost>) -> Self {
        ShellRunner {
            shell_location: shell_location.into(),
            host,
            session: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &Arc<ShellHost> {
        &self.host
    }

    fn build_session(&self) -> Result<ShellSession, String> {
        let pm = self.host.pm();
        let adapter = pm.adapter();
        let module = adapter
            .load(&self.shell_location)
            .map_err(|e| e.to_string())?;
        let mut store = Store::new(adapter.engine().clone());
        let limits = pm.limits();

        let mut wasi = WasiEnv::new(
            pm.fs(),
            vec!["wsh".to_string()],
            self.host.env_snapshot(),
            self.host.cwd_string(),
            Vec::new(),
            limits.stdout_bytes,
            None,
            pm.cancel_token(),
        );
        wasi.set_stderr_limit(limits.stderr_bytes);
        let wasi_env = FunctionEnv::new(&mut store, wasi);
        let mut all_imports = build_imports(&mut store, &wasi_env);

        let shell_env = FunctionEnv::new(
            &mut store,
            ShellEnv {
                host: self.host.clone(),
                memory: None,
                stash: None,
                rpc_limit: limits.rpc_bytes,
            },
        );
        let shell_imports = build_shell_imports(&mut store, &shell_env);
        all_imports.extend(&shell_imports);

        let instance =
            Instance::new(&mut store, &module, &all_imports).map_err(|e| e.to_string())?;
        let memory = instance
            .exports
            .get_memory("memory")
            .map_err(|e| e.to_string())?
            .clone();
        wasi_env.as_mut(&mut store).memory = Some(memory.clone());
        shell_env.as_mut(&mut store).memory = Some(memory);

        Ok(ShellSession {
            store,
            instance,
            wasi_env,
        })
    }

    pub fn run(&self, command: &str, deadline_ms: Option<u64>) -> RunResult {
        let started = Instant::now();
        let limits = self.host.pm().limits();
        if command.len() > limits.command_bytes {
            return RunResult::limit(format!(
                "command exceeds {} byte limit",
                limits.command_bytes
            ));
        }
        if self.host.pm().cancel_token().is_cancelled() {
            return RunResult::cancelled();
        }
        let deadline = deadline_ms.map(|ms| started + Duration::from_millis(ms));
        self.host.set_deadline(deadline);

        let mut guard = self.session.lock();
        if guard.is_none() {
            match self.build_session() {
                Ok(session) => *guard = Some(session),
                Err(message) => {
                    return RunResult {
                        exit_code: EXIT_NOT_FOUND,
                        stdout: String::new(),
                        stderr: format!("{message}\n"),
                        execution_time_ms: started.elapsed().as_millis() as u64,
                        truncated: None,
                        error_class: None,
                    }
                }
            }
        }
        let session = guard.as_mut().expect("session ensured above");
        session.wasi_env.as_mut(&mut session.store).deadline = deadline;

        let outcome = drive_shell(session, command);
        let ((stdout, out_trunc), (stderr_bytes, err_trunc)) =
            session.wasi_env.as_mut(&mut session.store).take_outputs();

        let (exit_code, error_class, trap_message) = outcome;
        let mut stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
        if let Some(message) = &trap_message {
            stderr.push_str(message);
            stderr.push('\n');
        }
        // Abnormal unwinds leave the guest in an unknown state; rebuild
        // next run.
        if error_class.is_some() || trap_message.is_some() {
            *guard = None;
        }

        let truncated = Truncated {
            stdout: out_trunc,
            stderr: err_trunc,
        };
        RunResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            execution_time_ms: started.elapsed().as_millis() as u64,
            truncated: truncated.any().then_some(truncated),
            error_class,
        }
    }
}

/// Copy the command into the guest and call `run_command`.
fn drive_shell(
    session: &mut ShellSession,
    command: &str,
) -> (i32, Option<ErrorClass>, Option<String>) {
    let alloc = match session
        .instance
        .exports
        .get_typed_function::<u32, u32>(&session.store, "alloc")
    {
        Ok(f) => f,
        Err(_) => {
            return (
                EXIT_NOT_FOUND,
                None,
                Some("shell guest exports no alloc".to_string()),
            )
        }
    };
    let run_command = match session
        .instance
        .exports
        .get_typed_function::<(u32, u32), i32>(&session.store, "run_command")
    {
        Ok(f) => f,
        Err(_) => {
            return (
                EXIT_NOT_FOUND,
                None,
                Some("shell guest exports no run_command".to_string()),
            )
        }
    };

    let ptr = match alloc.call(&mut session.store, command.len() as u32) {
        Ok(ptr) => ptr,
        Err(err) => {
            let (code, class, trap) = crate::process::classify(err);
            return (code, class, trap);
        }
    };
    let memory = match session.instance.exports.get_memory("memory") {
        Ok(m) => m.clone(),
        Err(_) => {
            return (
                EXIT_NOT_FOUND,
                None,
                Some("shell guest exports no memory".to_string()),
            )
        }
    };
    if memory
        .view(&session.store)
        .write(ptr as u64, command.as_bytes())
        .is_err()
    {
        return (
            EXIT_NOT_FOUND,
            None,
            Some("failed to write command into guest memory".to_string()),
        );
    }

    match run_command.call(&mut session.store, ptr, command.len() as u32) {
        Ok(code) => (code, None, None),
        Err(err) => crate::process::classify(err),
    }
}
