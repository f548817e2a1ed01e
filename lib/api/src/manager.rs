use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::PersistenceBackend;

/// Debounced autosave over a [`PersistenceBackend`].
///
/// Every change notification re-arms a single timer; when it fires, the
/// state source is serialized and saved on a dedicated thread. Saves
/// are serialized with single-slot coalescing: changes that land while
/// a save runs collapse into at most one follow-up save. Persistence
/// failures are logged and never propagate.
pub struct PersistenceManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

type StateSource = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

struct Inner {
    backend: Arc<dyn PersistenceBackend>,
    namespace: String,
    debounce: Duration,
    source: StateSource,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    due: Option<Instant>,
    disposed: bool,
    saves: u64,
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("namespace", &self.inner.namespace)
            .field("debounce", &self.inner.debounce)
            .finish_non_exhaustive()
    }
}

impl PersistenceManager {
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        namespace: impl Into<String>,
        autosave_ms: u64,
        source: StateSource,
    ) -> Self {
        let inner = Arc::new(Inner {
            backend,
            namespace: namespace.into(),
            debounce: Duration::from_millis(autosave_ms),
            source,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });
        let run_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("wasmbox-autosave".to_string())
            .spawn(move || run_loop(run_inner))
            .expect("spawn autosave thread");
        PersistenceManager {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Called from the VFS change hook; re-arms the debounce timer.
    pub fn mark_dirty(&self) {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return;
        }
        state.due = Some(Instant::now() + self.inner.debounce);
        self.inner.cond.notify_all();
    }

    /// Synchronous save, bypassing the debounce.
    pub fn save_now(&self) -> Result<(), String> {
        let bytes = (self.inner.source)();
        self.inner.backend.save(&self.inner.namespace, &bytes)?;
        self.inner.state.lock().saves += 1;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<Vec<u8>>, String> {
        self.inner.backend.load(&self.inner.namespace)
    }

    pub fn delete(&self) -> Result<(), String> {
        self.inner.backend.delete(&self.inner.namespace)
    }

    /// Completed save count, for tests and diagnostics.
    pub fn save_count(&self) -> u64 {
        self.inner.state.lock().saves
    }

    /// Flush a pending save, then stop the autosave thread.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            self.inner.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PersistenceManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_loop(inner: Arc<Inner>) {
    loop {
        {
            let mut state = inner.state.lock();
            loop {
                if state.disposed {
                    break;
                }
                match state.due {
                    None => inner.cond.wait(&mut state),
                    Some(due) => {
                        if Instant::now() >= due {
                            break;
                        }
                        let _ = inner.cond.wait_until(&mut state, due);
                    }
                }
            }
            if state.due.is_none() {
                // Disposed with nothing pending.
                return;
            }
            state.due = None;
        }

        let bytes = (inner.source)();
        if let Err(err) = inner.backend.save(&inner.namespace, &bytes) {
            tracing::warn!(namespace = %inner.namespace, error = %err, "autosave failed");
        }

        let mut state = inner.state.lock();
        state.saves += 1;
        if state.disposed && state.due.is_none() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn counter_source(payload: &'static [u8]) -> StateSource {
        Arc::new(move || payload.to_vec())
    }

    #[test]
    fn autosave_fires_after_debounce() {
        let backend = Arc::new(MemoryBackend::new());
        let manager =
            PersistenceManager::new(backend.clone(), "ns", 30, counter_source(b"state"));
        manager.mark_dirty();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(backend.load("ns").unwrap().unwrap(), b"state");
        assert_eq!(manager.save_count(), 1);
    }

    #[test]
    fn rapid_changes_coalesce_into_one_save() {
        let backend = Arc::new(MemoryBackend::new());
        let manager =
            PersistenceManager::new(backend.clone(), "ns", 50, counter_source(b"state"));
        for _ in 0..20 {
            manager.mark_dirty();
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(manager.save_count(), 1);
    }

    #[test]
    fn dispose_flushes_pending_save() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = PersistenceManager::new(
            backend.clone(),
            "ns",
            60_000, // debounce far in the future
            counter_source(b"pending"),
        );
        manager.mark_dirty();
        manager.dispose();
        assert_eq!(backend.load("ns").unwrap().unwrap(), b"pending");
    }

    #[test]
    fn backend_failure_is_not_fatal() {
        #[derive(Debug)]
        struct FailingBackend;
        impl PersistenceBackend for FailingBackend {
            fn load(&self, _ns: &str) -> Result<Option<Vec<u8>>, String> {
                Ok(None)
            }
            fn save(&self, _ns: &str, _bytes: &[u8]) -> Result<(), String> {
                Err("disk on fire".to_string())
            }
            fn delete(&self, _ns: &str) -> Result<(), String> {
                Ok(())
            }
        }
        let manager =
            PersistenceManager::new(Arc::new(FailingBackend), "ns", 10, counter_source(b"x"));
        manager.mark_dirty();
        std::thread::sleep(Duration::from_millis(100));
        // Still alive and accepting further work.
        manager.mark_dirty();
        manager.dispose();
    }
}
