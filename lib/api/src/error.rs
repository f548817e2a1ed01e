use thiserror::Error;

use wasmbox_vfs::FsError;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("unsupported state blob version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed state blob: {0}")]
    MalformedBlob(String),
    #[error("persistence backend: {0}")]
    Backend(String),
    #[error("module: {0}")]
    Module(String),
}
