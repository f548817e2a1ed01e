//! The `wasi_snapshot_preview1` import set.
//!
//! Each syscall follows the same shape: poll the interrupt state (this
//! is where deadlines and cancellation take effect), grab the exported
//! memory, then run an errno-typed body whose failure value is handed
//! back to the guest. Only `proc_exit` and interrupts unwind the guest
//! with a user trap.

use std::io::SeekFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use wasmer::{imports, Function, FunctionEnv, FunctionEnvMut, Imports, MemoryView, RuntimeError, Store};

use wasmbox_vfs::{path as vpath, FileStat, FileType, OpenMode};

use crate::abi::*;
use crate::env::{ExitCode, WasiEnv, PREOPEN_FD};
use crate::mem;

/// Build the full import object for one spawn.
pub fn build_imports(store: &mut Store, env: &FunctionEnv<WasiEnv>) -> Imports {
    imports! {
        "wasi_snapshot_preview1" => {
            "args_get" => Function::new_typed_with_env(store, env, args_get),
            "args_sizes_get" => Function::new_typed_with_env(store, env, args_sizes_get),
            "environ_get" => Function::new_typed_with_env(store, env, environ_get),
            "environ_sizes_get" => Function::new_typed_with_env(store, env, environ_sizes_get),
            "clock_time_get" => Function::new_typed_with_env(store, env, clock_time_get),
            "random_get" => Function::new_typed_with_env(store, env, random_get),
            "fd_read" => Function::new_typed_with_env(store, env, fd_read),
            "fd_write" => Function::new_typed_with_env(store, env, fd_write),
            "fd_seek" => Function::new_typed_with_env(store, env, fd_seek),
            "fd_close" => Function::new_typed_with_env(store, env, fd_close),
            "fd_fdstat_get" => Function::new_typed_with_env(store, env, fd_fdstat_get),
            "fd_filestat_get" => Function::new_typed_with_env(store, env, fd_filestat_get),
            "fd_prestat_get" => Function::new_typed_with_env(store, env, fd_prestat_get),
            "fd_prestat_dir_name" => Function::new_typed_with_env(store, env, fd_prestat_dir_name),
            "path_open" => Function::new_typed_with_env(store, env, path_open),
            "path_filestat_get" => Function::new_typed_with_env(store, env, path_filestat_get),
            "path_create_directory" => Function::new_typed_with_env(store, env, path_create_directory),
            "path_remove_directory" => Function::new_typed_with_env(store, env, path_remove_directory),
            "path_unlink_file" => Function::new_typed_with_env(store, env, path_unlink_file),
            "path_rename" => Function::new_typed_with_env(store, env, path_rename),
            "path_symlink" => Function::new_typed_with_env(store, env, path_symlink),
            "path_readlink" => Function::new_typed_with_env(store, env, path_readlink),
            "poll_oneoff" => Function::new_typed_with_env(store, env, poll_oneoff),
            "proc_exit" => Function::new_typed_with_env(store, env, proc_exit),
        }
    }
}

fn errno(e: u16) -> Result<i32, RuntimeError> {
    Ok(e as i32)
}

/// Clone the exported memory out of the env, or fail with EINVAL before
/// `_start` has run (no guest should reach a syscall that early).
macro_rules! guest_memory {
    ($env:expr) => {
        match $env.memory {
            Some(ref m) => m.clone(),
            None => return errno(ERRNO_INVAL),
        }
    };
}

/// Resolve a guest-supplied path against the root preopen. wasi-libc
/// hands over preopen-relative paths with the cwd already applied, so
/// everything is anchored at `/`.
fn guest_path(raw: &str) -> String {
    vpath::join("/", raw)
}

fn filetype_of(stat: &FileStat) -> u8 {
    match stat.file_type {
        FileType::File => FILETYPE_REGULAR_FILE,
        FileType::Dir => FILETYPE_DIRECTORY,
        FileType::Symlink => FILETYPE_SYMBOLIC_LINK,
    }
}

fn write_filestat(
    view: &MemoryView,
    ptr: u32,
    filetype: u8,
    size: u64,
    times_ms: (u64, u64, u64),
) -> Result<(), u16> {
    mem::write_u64(view, ptr, 0)?; // dev
    mem::write_u64(view, ptr + 8, 0)?; // ino
    mem::write_bytes(view, ptr + 16, &[filetype, 0, 0, 0, 0, 0, 0, 0])?;
    mem::write_u64(view, ptr + 24, 1)?; // nlink
    mem::write_u64(view, ptr + 32, size)?;
    mem::write_u64(view, ptr + 40, times_ms.0.saturating_mul(1_000_000))?;
    mem::write_u64(view, ptr + 48, times_ms.1.saturating_mul(1_000_000))?;
    mem::write_u64(view, ptr + 56, times_ms.2.saturating_mul(1_000_000))?;
    Ok(())
}

// --- argv / envp ---------------------------------------------------------

fn args_sizes_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    argc_ptr: u32,
    buf_size_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let total: usize = env.args.iter().map(|a| a.len() + 1).sum();
    let body = || -> Result<(), u16> {
        mem::write_u32(&view, argc_ptr, env.args.len() as u32)?;
        mem::write_u32(&view, buf_size_ptr, total as u32)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn args_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    argv_ptr: u32,
    argv_buf_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let mut cursor = argv_buf_ptr;
        for (i, arg) in env.args.iter().enumerate() {
            mem::write_u32(&view, argv_ptr + (i as u32) * 4, cursor)?;
            mem::write_bytes(&view, cursor, arg.as_bytes())?;
            mem::write_bytes(&view, cursor + arg.len() as u32, &[0])?;
            cursor += arg.len() as u32 + 1;
        }
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn environ_sizes_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    count_ptr: u32,
    buf_size_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let total: usize = env.env.iter().map(|(k, v)| k.len() + 1 + v.len() + 1).sum();
    let body = || -> Result<(), u16> {
        mem::write_u32(&view, count_ptr, env.env.len() as u32)?;
        mem::write_u32(&view, buf_size_ptr, total as u32)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn environ_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    environ_ptr: u32,
    environ_buf_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let mut cursor = environ_buf_ptr;
        for (i, (key, value)) in env.env.iter().enumerate() {
            mem::write_u32(&view, environ_ptr + (i as u32) * 4, cursor)?;
            let entry = format!("{key}={value}");
            mem::write_bytes(&view, cursor, entry.as_bytes())?;
            mem::write_bytes(&view, cursor + entry.len() as u32, &[0])?;
            cursor += entry.len() as u32 + 1;
        }
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

// --- clocks & randomness -------------------------------------------------

fn clock_time_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    clock_id: i32,
    _precision: i64,
    time_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let now_ns = match clock_id as u32 {
        CLOCKID_REALTIME => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0),
        CLOCKID_MONOTONIC => env.started.elapsed().as_nanos() as u64,
        _ => return errno(ERRNO_INVAL),
    };
    match mem::write_u64(&view, time_ptr, now_ns) {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn random_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    buf_ptr: u32,
    buf_len: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let mut bytes = vec![0u8; buf_len as usize];
    if getrandom::getrandom(&mut bytes).is_err() {
        return errno(ERRNO_IO);
    }
    match mem::write_bytes(&view, buf_ptr, &bytes) {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

// --- fd ops --------------------------------------------------------------

fn fd_read(
    mut ctx: FunctionEnvMut<WasiEnv>,
    fd: i32,
    iovs: u32,
    iovs_len: u32,
    nread_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let mut body = || -> Result<(), u16> {
        let iovecs = mem::read_iovecs(&view, iovs, iovs_len)?;
        let mut total = 0u32;
        for (ptr, len) in iovecs {
            let mut buf = vec![0u8; len as usize];
            let n = match fd {
                0 => env.read_stdin(&mut buf),
                1 | 2 => return Err(ERRNO_BADF),
                n if n as u32 == PREOPEN_FD => return Err(ERRNO_BADF),
                n => env
                    .fd_table
                    .read(n as u32, &mut buf)
                    .map_err(fs_errno)?,
            };
            mem::write_bytes(&view, ptr, &buf[..n])?;
            total += n as u32;
            if n < len as usize {
                break;
            }
        }
        mem::write_u32(&view, nread_ptr, total)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn fd_write(
    mut ctx: FunctionEnvMut<WasiEnv>,
    fd: i32,
    iovs: u32,
    iovs_len: u32,
    nwritten_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let mut body = || -> Result<(), u16> {
        let iovecs = mem::read_iovecs(&view, iovs, iovs_len)?;
        let mut payload = Vec::new();
        for (ptr, len) in iovecs {
            payload.extend_from_slice(&mem::read_bytes(&view, ptr, len)?);
        }
        match fd {
            1 => env.stdout.push(&payload),
            2 => env.stderr.push(&payload),
            0 => return Err(ERRNO_BADF),
            n if n as u32 == PREOPEN_FD => return Err(ERRNO_BADF),
            n => {
                env.fd_table
                    .write(n as u32, &payload)
                    .map_err(fs_errno)?;
            }
        }
        mem::write_u32(&view, nwritten_ptr, payload.len() as u32)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn fd_seek(
    mut ctx: FunctionEnvMut<WasiEnv>,
    fd: i32,
    offset: i64,
    whence: i32,
    newoffset_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    if (0..=2).contains(&fd) {
        return errno(ERRNO_SPIPE);
    }
    if fd as u32 == PREOPEN_FD {
        return errno(ERRNO_BADF);
    }
    let pos = match whence as u8 {
        WHENCE_SET => SeekFrom::Start(offset.max(0) as u64),
        WHENCE_CUR => SeekFrom::Current(offset),
        WHENCE_END => SeekFrom::End(offset),
        _ => return errno(ERRNO_INVAL),
    };
    let mut body = || -> Result<(), u16> {
        let new_pos = env.fd_table.seek(fd as u32, pos).map_err(fs_errno)?;
        mem::write_u64(&view, newoffset_ptr, new_pos)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn fd_close(mut ctx: FunctionEnvMut<WasiEnv>, fd: i32) -> Result<i32, RuntimeError> {
    let (env, _store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    // Stdio and the preopen stay open for the life of the spawn.
    if (0..=2).contains(&fd) || fd as u32 == PREOPEN_FD {
        return errno(ERRNO_SUCCESS);
    }
    match env.fd_table.close(fd as u32) {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(fs_errno(e)),
    }
}

fn fd_fdstat_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    fd: i32,
    stat_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let filetype = match fd {
        0..=2 => FILETYPE_CHARACTER_DEVICE,
        n if n as u32 == PREOPEN_FD => FILETYPE_DIRECTORY,
        n if env.fd_table.is_open(n as u32) => FILETYPE_REGULAR_FILE,
        _ => return errno(ERRNO_BADF),
    };
    let body = || -> Result<(), u16> {
        mem::write_bytes(&view, stat_ptr, &[filetype, 0])?;
        mem::write_bytes(&view, stat_ptr + 2, &0u16.to_le_bytes())?; // fs_flags
        mem::write_bytes(&view, stat_ptr + 4, &[0, 0, 0, 0])?; // padding
        mem::write_u64(&view, stat_ptr + 8, RIGHTS_ALL)?;
        mem::write_u64(&view, stat_ptr + 16, RIGHTS_ALL)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn fd_filestat_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    fd: i32,
    stat_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        match fd {
            0..=2 => write_filestat(&view, stat_ptr, FILETYPE_CHARACTER_DEVICE, 0, (0, 0, 0)),
            n if n as u32 == PREOPEN_FD => {
                write_filestat(&view, stat_ptr, FILETYPE_DIRECTORY, 0, (0, 0, 0))
            }
            n => {
                let size = env.fd_table.size(n as u32).map_err(fs_errno)?;
                write_filestat(&view, stat_ptr, FILETYPE_REGULAR_FILE, size, (0, 0, 0))
            }
        }
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn fd_prestat_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    fd: i32,
    prestat_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    if fd as u32 != PREOPEN_FD {
        return errno(ERRNO_BADF);
    }
    let body = || -> Result<(), u16> {
        mem::write_u32(&view, prestat_ptr, PREOPENTYPE_DIR as u32)?;
        mem::write_u32(&view, prestat_ptr + 4, 1)?; // strlen("/")
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn fd_prestat_dir_name(
    mut ctx: FunctionEnvMut<WasiEnv>,
    fd: i32,
    path_ptr: u32,
    path_len: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    if fd as u32 != PREOPEN_FD {
        return errno(ERRNO_BADF);
    }
    if path_len < 1 {
        return errno(ERRNO_INVAL);
    }
    match mem::write_bytes(&view, path_ptr, b"/") {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

// --- path ops ------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn path_open(
    mut ctx: FunctionEnvMut<WasiEnv>,
    _dirfd: i32,
    _dirflags: u32,
    path_ptr: u32,
    path_len: u32,
    oflags: i32,
    rights_base: i64,
    _rights_inheriting: i64,
    fdflags: i32,
    opened_fd_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let mut body = || -> Result<(), u16> {
        let raw = mem::read_string(&view, path_ptr, path_len)?;
        let full = guest_path(&raw);
        let oflags = oflags as u16;
        let fdflags = fdflags as u16;
        let rights = rights_base as u64;
        let want_write = rights & RIGHTS_FD_WRITE != 0
            || oflags & (OFLAGS_CREAT | OFLAGS_TRUNC) != 0
            || fdflags & FDFLAGS_APPEND != 0;

        let existing = match env.fs.stat(&full) {
            Ok(stat) => Some(stat),
            Err(wasmbox_vfs::FsError::EntryNotFound) => None,
            Err(err) => return Err(fs_errno(err)),
        };
        if let Some(stat) = &existing {
            if stat.is_dir() {
                // Directory handles are not modeled; fd_readdir is not
                // part of the supported surface.
                return Err(if oflags & OFLAGS_DIRECTORY != 0 {
                    ERRNO_NOTSUP
                } else {
                    ERRNO_ISDIR
                });
            }
            if oflags & OFLAGS_CREAT != 0 && oflags & OFLAGS_EXCL != 0 {
                return Err(ERRNO_EXIST);
            }
        } else {
            if oflags & OFLAGS_CREAT == 0 {
                return Err(ERRNO_NOENT);
            }
            env.fs.write_file(&full, b"").map_err(fs_errno)?;
        }

        let mode = if fdflags & FDFLAGS_APPEND != 0 {
            OpenMode::Append
        } else if want_write && oflags & OFLAGS_TRUNC != 0 {
            OpenMode::Write
        } else if want_write {
            OpenMode::ReadWrite
        } else {
            OpenMode::Read
        };
        let fd = env.fd_table.open(&full, mode).map_err(fs_errno)?;
        mem::write_u32(&view, opened_fd_ptr, fd)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn path_filestat_get(
    mut ctx: FunctionEnvMut<WasiEnv>,
    _dirfd: i32,
    flags: u32,
    path_ptr: u32,
    path_len: u32,
    stat_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let raw = mem::read_string(&view, path_ptr, path_len)?;
        let full = guest_path(&raw);
        let stat = if flags & LOOKUPFLAGS_SYMLINK_FOLLOW != 0 {
            env.fs.stat(&full)
        } else {
            env.fs.lstat(&full)
        }
        .map_err(fs_errno)?;
        write_filestat(
            &view,
            stat_ptr,
            filetype_of(&stat),
            stat.size,
            (stat.atime, stat.mtime, stat.ctime),
        )
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn path_create_directory(
    mut ctx: FunctionEnvMut<WasiEnv>,
    _dirfd: i32,
    path_ptr: u32,
    path_len: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let raw = mem::read_string(&view, path_ptr, path_len)?;
        env.fs.mkdir(&guest_path(&raw)).map_err(fs_errno)
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn path_remove_directory(
    mut ctx: FunctionEnvMut<WasiEnv>,
    _dirfd: i32,
    path_ptr: u32,
    path_len: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let raw = mem::read_string(&view, path_ptr, path_len)?;
        env.fs.rmdir(&guest_path(&raw)).map_err(fs_errno)
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn path_unlink_file(
    mut ctx: FunctionEnvMut<WasiEnv>,
    _dirfd: i32,
    path_ptr: u32,
    path_len: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let raw = mem::read_string(&view, path_ptr, path_len)?;
        env.fs.unlink(&guest_path(&raw)).map_err(fs_errno)
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

#[allow(clippy::too_many_arguments)]
fn path_rename(
    mut ctx: FunctionEnvMut<WasiEnv>,
    _old_dirfd: i32,
    old_ptr: u32,
    old_len: u32,
    _new_dirfd: i32,
    new_ptr: u32,
    new_len: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let old = mem::read_string(&view, old_ptr, old_len)?;
        let new = mem::read_string(&view, new_ptr, new_len)?;
        env.fs
            .rename(&guest_path(&old), &guest_path(&new))
            .map_err(fs_errno)
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn path_symlink(
    mut ctx: FunctionEnvMut<WasiEnv>,
    old_ptr: u32,
    old_len: u32,
    _dirfd: i32,
    new_ptr: u32,
    new_len: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        // The link target is stored verbatim; only the link path is
        // anchored at the preopen.
        let target = mem::read_string(&view, old_ptr, old_len)?;
        let link = mem::read_string(&view, new_ptr, new_len)?;
        env.fs
            .symlink(&target, &guest_path(&link))
            .map_err(fs_errno)
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

#[allow(clippy::too_many_arguments)]
fn path_readlink(
    mut ctx: FunctionEnvMut<WasiEnv>,
    _dirfd: i32,
    path_ptr: u32,
    path_len: u32,
    buf_ptr: u32,
    buf_len: u32,
    bufused_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);
    let body = || -> Result<(), u16> {
        let raw = mem::read_string(&view, path_ptr, path_len)?;
        let target = env.fs.read_link(&guest_path(&raw)).map_err(fs_errno)?;
        let bytes = target.as_bytes();
        let n = bytes.len().min(buf_len as usize);
        mem::write_bytes(&view, buf_ptr, &bytes[..n])?;
        mem::write_u32(&view, bufused_ptr, n as u32)?;
        Ok(())
    };
    match body() {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

// --- poll / exit ---------------------------------------------------------

/// Clock subscriptions sleep (bounded by the spawn deadline); anything
/// else yields no event.
fn poll_oneoff(
    mut ctx: FunctionEnvMut<WasiEnv>,
    subs_ptr: u32,
    events_ptr: u32,
    nsubs: u32,
    nevents_ptr: u32,
) -> Result<i32, RuntimeError> {
    let (env, store) = ctx.data_and_store_mut();
    env.check_interrupt()?;
    let memory = guest_memory!(env);
    let view = memory.view(&store);

    let mut nevents = 0u32;
    for i in 0..nsubs {
        let base = subs_ptr + i * SUBSCRIPTION_SIZE;
        let (userdata, tag) = {
            let userdata = match mem::read_u64(&view, base) {
                Ok(v) => v,
                Err(e) => return errno(e),
            };
            let tag = match mem::read_bytes(&view, base + 8, 1) {
                Ok(b) => b[0],
                Err(e) => return errno(e),
            };
            (userdata, tag)
        };
        if tag != EVENTTYPE_CLOCK {
            continue;
        }
        let timeout_ns = match mem::read_u64(&view, base + 24) {
            Ok(v) => v,
            Err(e) => return errno(e),
        };
        let mut sleep = Duration::from_nanos(timeout_ns);
        if let Some(remaining) = env.remaining_ms() {
            sleep = sleep.min(Duration::from_millis(remaining));
        }
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
        // A deadline that fired during the sleep unwinds here.
        env.check_interrupt()?;
        let event_base = events_ptr + nevents * EVENT_SIZE;
        let write_event = || -> Result<(), u16> {
            mem::write_u64(&view, event_base, userdata)?;
            mem::write_bytes(&view, event_base + 8, &0u16.to_le_bytes())?;
            mem::write_bytes(&view, event_base + 10, &[EVENTTYPE_CLOCK])?;
            Ok(())
        };
        if let Err(e) = write_event() {
            return errno(e);
        }
        nevents += 1;
    }
    match mem::write_u32(&view, nevents_ptr, nevents) {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(e) => errno(e),
    }
}

fn proc_exit(_ctx: FunctionEnvMut<WasiEnv>, code: i32) -> Result<(), RuntimeError> {
    tracing::trace!(code, "proc_exit");
    Err(RuntimeError::user(Box::new(ExitCode(code))))
}
