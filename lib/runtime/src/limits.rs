use serde::{Deserialize, Serialize};

/// Per-spawn resource limits. All byte limits are hard caps; output past
/// a stream limit is dropped with the truncation flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    /// Longest accepted `run()` command string.
    pub command_bytes: usize,
    /// Cap on regular files in the sandbox tree.
    pub file_count: usize,
    /// Largest accepted host-bridge request payload.
    pub rpc_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            stdout_bytes: 10 * 1024 * 1024,
            stderr_bytes: 10 * 1024 * 1024,
            command_bytes: 1024 * 1024,
            file_count: 10_000,
            rpc_bytes: 16 * 1024 * 1024,
        }
    }
}
