//! WASI preview-1 wire-format constants.
//!
//! Only the slice of the ABI the shipped guests exercise is defined
//! here; values match the `wasi_snapshot_preview1` witx definitions.

#![allow(dead_code)]

use wasmbox_vfs::FsError;

pub const ERRNO_SUCCESS: u16 = 0;
pub const ERRNO_ACCES: u16 = 2;
pub const ERRNO_AGAIN: u16 = 6;
pub const ERRNO_BADF: u16 = 8;
pub const ERRNO_CANCELED: u16 = 11;
pub const ERRNO_DQUOT: u16 = 19;
pub const ERRNO_EXIST: u16 = 20;
pub const ERRNO_FAULT: u16 = 21;
pub const ERRNO_INTR: u16 = 27;
pub const ERRNO_INVAL: u16 = 28;
pub const ERRNO_IO: u16 = 29;
pub const ERRNO_ISDIR: u16 = 31;
pub const ERRNO_LOOP: u16 = 32;
pub const ERRNO_NOENT: u16 = 44;
pub const ERRNO_NOSYS: u16 = 52;
pub const ERRNO_NOTDIR: u16 = 54;
pub const ERRNO_NOTEMPTY: u16 = 55;
pub const ERRNO_NOTSUP: u16 = 58;
pub const ERRNO_PERM: u16 = 63;
pub const ERRNO_PIPE: u16 = 64;
pub const ERRNO_ROFS: u16 = 69;
pub const ERRNO_SPIPE: u16 = 70;

pub const FILETYPE_UNKNOWN: u8 = 0;
pub const FILETYPE_CHARACTER_DEVICE: u8 = 2;
pub const FILETYPE_DIRECTORY: u8 = 3;
pub const FILETYPE_REGULAR_FILE: u8 = 4;
pub const FILETYPE_SYMBOLIC_LINK: u8 = 7;

pub const WHENCE_SET: u8 = 0;
pub const WHENCE_CUR: u8 = 1;
pub const WHENCE_END: u8 = 2;

pub const CLOCKID_REALTIME: u32 = 0;
pub const CLOCKID_MONOTONIC: u32 = 1;

pub const OFLAGS_CREAT: u16 = 1 << 0;
pub const OFLAGS_DIRECTORY: u16 = 1 << 1;
pub const OFLAGS_EXCL: u16 = 1 << 2;
pub const OFLAGS_TRUNC: u16 = 1 << 3;

pub const FDFLAGS_APPEND: u16 = 1 << 0;

pub const LOOKUPFLAGS_SYMLINK_FOLLOW: u32 = 1 << 0;

pub const RIGHTS_FD_READ: u64 = 1 << 1;
pub const RIGHTS_FD_WRITE: u64 = 1 << 6;
/// Full rights mask handed back by `fd_fdstat_get`; the sandbox enforces
/// nothing through rights.
pub const RIGHTS_ALL: u64 = u64::MAX;

pub const PREOPENTYPE_DIR: u8 = 0;

pub const EVENTTYPE_CLOCK: u8 = 0;

/// Size of one `subscription` record.
pub const SUBSCRIPTION_SIZE: u32 = 48;
/// Size of one `event` record.
pub const EVENT_SIZE: u32 = 32;

/// Stable mapping from VFS error kinds to WASI errno values.
pub fn fs_errno(err: FsError) -> u16 {
    match err {
        FsError::EntryNotFound => ERRNO_NOENT,
        FsError::AlreadyExists => ERRNO_EXIST,
        FsError::BaseNotDirectory => ERRNO_NOTDIR,
        FsError::IsADirectory => ERRNO_ISDIR,
        FsError::ReadOnly => ERRNO_ROFS,
        FsError::TooManySymlinks => ERRNO_LOOP,
        FsError::DirectoryNotEmpty => ERRNO_NOTEMPTY,
        FsError::InvalidInput => ERRNO_INVAL,
        FsError::InvalidFd => ERRNO_BADF,
        FsError::QuotaExceeded => ERRNO_DQUOT,
        FsError::BrokenPipe => ERRNO_PIPE,
        FsError::Interrupted => ERRNO_INTR,
        FsError::Unsupported => ERRNO_NOTSUP,
    }
}
