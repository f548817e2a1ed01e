use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FsError, Result};

#[derive(Debug, Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// In-memory byte stream used to stitch pipeline stages together.
///
/// Clones share the same buffer. Reads drain in FIFO order and return
/// zero once the buffer is empty; after [`Pipe::close`] an empty read is
/// a definitive EOF and further writes fail with `BrokenPipe`.
#[derive(Debug, Clone, Default)]
pub struct Pipe {
    inner: Arc<Mutex<PipeState>>,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(FsError::BrokenPipe);
        }
        state.buf.extend(data.iter().copied());
        Ok(data.len())
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.inner.lock();
        let n = buf.len().min(state.buf.len());
        for slot in buf.iter_mut().take(n) {
            match state.buf.pop_front() {
                Some(byte) => *slot = byte,
                None => break,
            }
        }
        n
    }

    /// Drain everything currently buffered.
    pub fn read_to_end(&self) -> Vec<u8> {
        let mut state = self.inner.lock();
        state.buf.drain(..).collect()
    }

    /// Close the write end. Pending bytes stay readable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }
}
