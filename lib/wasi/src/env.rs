use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use wasmer::{Memory, RuntimeError};

use wasmbox_vfs::{FdTable, FileSystem, Pipe};

/// WASI descriptor preopened on the sandbox root.
pub const PREOPEN_FD: u32 = 3;

/// Reason a guest was unwound from inside a host import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    #[error("deadline exceeded")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

/// Carrier for `proc_exit`: raised as a user trap and downcast at the
/// spawn boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("process exited with code {0}")]
pub struct ExitCode(pub i32);

/// Cooperative cancellation flag shared between a sandbox and its
/// running spawns. Checked on every host-import entry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Byte-limited output sink for guest stdout/stderr. Writes past the
/// limit are dropped and the truncation flag latches.
#[derive(Debug)]
pub struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        CaptureBuffer {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Accept as much of `bytes` as the limit allows. The guest is told
    /// everything was written either way, so it keeps making progress.
    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        let take = bytes.len().min(room);
        self.data.extend_from_slice(&bytes[..take]);
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn take(self) -> (Vec<u8>, bool) {
        (self.data, self.truncated)
    }
}

/// Per-spawn host state handed to every WASI import.
pub struct WasiEnv {
    pub fs: Arc<dyn FileSystem>,
    pub fd_table: FdTable,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    stdin: Pipe,
    pub stdout: CaptureBuffer,
    pub stderr: CaptureBuffer,
    pub deadline: Option<Instant>,
    pub cancel: CancelToken,
    pub memory: Option<Memory>,
    pub started: Instant,
}

impl WasiEnv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
        stdin: Vec<u8>,
        output_limit: usize,
        deadline: Option<Instant>,
        cancel: CancelToken,
    ) -> Self {
        let mut fd_table = FdTable::new(fs.clone());
        // The preopen slot must never be handed out by `open`.
        fd_table
            .reserve(PREOPEN_FD, "/")
            .expect("fresh fd table has no preopen");
        // Stdin behaves like the read end of a closed pipe: the
        // supplied bytes drain in order, then reads hit EOF.
        let stdin_pipe = Pipe::new();
        let _ = stdin_pipe.write(&stdin);
        stdin_pipe.close();
        WasiEnv {
            fs,
            fd_table,
            args,
            env,
            cwd,
            stdin: stdin_pipe,
            stdout: CaptureBuffer::new(output_limit),
            stderr: CaptureBuffer::new(output_limit),
            deadline,
            cancel,
            memory: None,
            started: Instant::now(),
        }
    }

    /// Separate limits for the two streams.
    pub fn set_stderr_limit(&mut self, limit: usize) {
        self.stderr = CaptureBuffer::new(limit);
    }

    /// Raise a user trap if the spawn was cancelled or ran past its
    /// deadline. Called on entry to every import.
    pub fn check_interrupt(&self) -> Result<(), RuntimeError> {
        if self.cancel.is_cancelled() {
            return Err(RuntimeError::user(Box::new(Interrupt::Cancelled)));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(RuntimeError::user(Box::new(Interrupt::Timeout)));
            }
        }
        Ok(())
    }

    /// Milliseconds left until the deadline, if one is set.
    pub fn remaining_ms(&self) -> Option<u64> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64)
    }

    pub fn read_stdin(&mut self, buf: &mut [u8]) -> usize {
        self.stdin.read(buf)
    }

    /// Flush dirty descriptors and hand out the captured output,
    /// leaving empty buffers behind. Called once per spawn after the
    /// guest has returned or been unwound.
    pub fn take_outputs(&mut self) -> ((Vec<u8>, bool), (Vec<u8>, bool)) {
        let _ = self.fd_table.flush_all();
        let stdout = std::mem::replace(&mut self.stdout, CaptureBuffer::new(0));
        let stderr = std::mem::replace(&mut self.stderr, CaptureBuffer::new(0));
        (stdout.take(), stderr.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_buffer_latches_truncation() {
        let mut buf = CaptureBuffer::new(5);
        buf.push(b"abc");
        assert!(!buf.truncated());
        buf.push(b"defg");
        assert!(buf.truncated());
        let (data, truncated) = buf.take();
        assert_eq!(data, b"abcde");
        assert!(truncated);
    }

    #[test]
    fn cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }
}
