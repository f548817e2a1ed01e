use thiserror::Error;

/// Error kinds surfaced by every filesystem-facing operation.
///
/// Each variant corresponds to one POSIX errno the WASI layer hands back
/// to guests; [`FsError::code`] is the stable wire name used by the
/// worker-side VFS proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("entry not found")]
    EntryNotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("path component is not a directory")]
    BaseNotDirectory,
    #[error("entry is a directory")]
    IsADirectory,
    #[error("filesystem or mount is read-only")]
    ReadOnly,
    #[error("too many levels of symbolic links")]
    TooManySymlinks,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("invalid path or argument")]
    InvalidInput,
    #[error("invalid file descriptor")]
    InvalidFd,
    #[error("file quota exceeded")]
    QuotaExceeded,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("operation interrupted")]
    Interrupted,
    #[error("operation not supported")]
    Unsupported,
}

impl FsError {
    /// Stable machine-readable code, used as the `code` field of proxy
    /// error metadata and round-tripped by [`FsError::from_code`].
    pub fn code(&self) -> &'static str {
        match self {
            FsError::EntryNotFound => "ENOENT",
            FsError::AlreadyExists => "EEXIST",
            FsError::BaseNotDirectory => "ENOTDIR",
            FsError::IsADirectory => "EISDIR",
            FsError::ReadOnly => "EROFS",
            FsError::TooManySymlinks => "ELOOP",
            FsError::DirectoryNotEmpty => "ENOTEMPTY",
            FsError::InvalidInput => "EINVAL",
            FsError::InvalidFd => "EBADF",
            FsError::QuotaExceeded => "EDQUOT",
            FsError::BrokenPipe => "EPIPE",
            FsError::Interrupted => "EINTR",
            FsError::Unsupported => "ENOTSUP",
        }
    }

    /// Inverse of [`FsError::code`]. Unknown codes collapse to
    /// `Interrupted`, the kind a guest is expected to retry or abort on.
    pub fn from_code(code: &str) -> Self {
        match code {
            "ENOENT" => FsError::EntryNotFound,
            "EEXIST" => FsError::AlreadyExists,
            "ENOTDIR" => FsError::BaseNotDirectory,
            "EISDIR" => FsError::IsADirectory,
            "EROFS" => FsError::ReadOnly,
            "ELOOP" => FsError::TooManySymlinks,
            "ENOTEMPTY" => FsError::DirectoryNotEmpty,
            "EINVAL" => FsError::InvalidInput,
            "EBADF" => FsError::InvalidFd,
            "EDQUOT" => FsError::QuotaExceeded,
            "EPIPE" => FsError::BrokenPipe,
            "ENOTSUP" => FsError::Unsupported,
            _ => FsError::Interrupted,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let kinds = [
            FsError::EntryNotFound,
            FsError::AlreadyExists,
            FsError::BaseNotDirectory,
            FsError::IsADirectory,
            FsError::ReadOnly,
            FsError::TooManySymlinks,
            FsError::DirectoryNotEmpty,
            FsError::InvalidInput,
            FsError::InvalidFd,
            FsError::QuotaExceeded,
            FsError::BrokenPipe,
            FsError::Unsupported,
        ];
        for kind in kinds {
            assert_eq!(FsError::from_code(kind.code()), kind);
        }
    }
}
