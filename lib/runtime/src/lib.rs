//! Guest execution for the wasmbox sandbox: module loading and caching,
//! the per-spawn process lifecycle, the guest-shell host bridge, and
//! host-side extensions.
//!
//! Execution is sequential per sandbox. A spawn compiles nothing twice
//! (modules are cached per physical location), runs the guest to
//! completion on the calling thread, and reports everything through
//! [`RunResult`]. Runtime failures such as timeouts are data, not
//! errors.

mod adapter;
mod extensions;
mod glob;
mod limits;
mod process;
mod result;
mod shell;

pub use adapter::{ModuleSource, PlatformAdapter};
pub use extensions::{
    ExtensionConfig, ExtensionError, ExtensionHandler, ExtensionOutput, ExtensionRegistry,
    ExtensionRequest,
};
pub use glob::{glob_match, glob_walk};
pub use limits::Limits;
pub use process::{ProcessManager, SpawnOptions, SpawnOutcome};
pub use result::{ErrorClass, RunResult, Truncated, EXIT_CANCELLED, EXIT_NOT_FOUND, EXIT_TIMEOUT};
pub use shell::{FetchCall, FetchReply, ShellHost, ShellRunner, SpawnRequest, SpawnResult, StatInfo};
