//! WASI preview-1 host implementation bound to the wasmbox virtual
//! filesystem.
//!
//! One [`WasiEnv`] is built per spawn and handed to the guest through a
//! `wasi_snapshot_preview1` import object ([`build_imports`]). Guest
//! stdout/stderr land in byte-limited capture buffers; every import entry
//! polls the spawn's deadline and cancel token so a looping guest that
//! still performs syscalls can be unwound cooperatively.

pub mod abi;
mod env;
mod imports;
mod mem;

pub use env::{CancelToken, CaptureBuffer, ExitCode, Interrupt, WasiEnv, PREOPEN_FD};
pub use imports::build_imports;
