use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;

use parking_lot::Mutex;

/// Storage for persisted sandbox state, keyed by namespace. Failures
/// are strings: persistence is best-effort and never takes the sandbox
/// down.
pub trait PersistenceBackend: Debug + Send + Sync {
    fn load(&self, namespace: &str) -> Result<Option<Vec<u8>>, String>;
    fn save(&self, namespace: &str, bytes: &[u8]) -> Result<(), String>;
    fn delete(&self, namespace: &str) -> Result<(), String>;
}

/// Process-local backend; the default for session persistence.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.slots.lock().contains_key(namespace)
    }
}

impl PersistenceBackend for MemoryBackend {
    fn load(&self, namespace: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.slots.lock().get(namespace).cloned())
    }

    fn save(&self, namespace: &str, bytes: &[u8]) -> Result<(), String> {
        self.slots
            .lock()
            .insert(namespace.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, namespace: &str) -> Result<(), String> {
        self.slots.lock().remove(namespace);
        Ok(())
    }
}

/// Sanitize a namespace into a safe file stem: anything outside
/// `[A-Za-z0-9_-]` becomes `_`.
pub(crate) fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Host-file backend: one `<namespace>.wsnd` file per namespace under a
/// base directory.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileBackend { dir: dir.into() }
    }

    fn blob_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.wsnd", sanitize_namespace(namespace)))
    }
}

impl PersistenceBackend for FileBackend {
    fn load(&self, namespace: &str) -> Result<Option<Vec<u8>>, String> {
        match std::fs::read(self.blob_path(namespace)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.to_string()),
        }
    }

    fn save(&self, namespace: &str, bytes: &[u8]) -> Result<(), String> {
        std::fs::create_dir_all(&self.dir).map_err(|e| e.to_string())?;
        std::fs::write(self.blob_path(namespace), bytes).map_err(|e| e.to_string())
    }

    fn delete(&self, namespace: &str) -> Result<(), String> {
        match std::fs::remove_file(self.blob_path(namespace)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_sanitization() {
        assert_eq!(sanitize_namespace("my-session_1"), "my-session_1");
        assert_eq!(sanitize_namespace("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_namespace("a b/c"), "a_b_c");
    }

    #[test]
    fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.load("ns").unwrap(), None);
        backend.save("ns", b"payload").unwrap();
        assert_eq!(backend.load("ns").unwrap().unwrap(), b"payload");
        backend.delete("ns").unwrap();
        assert_eq!(backend.load("ns").unwrap(), None);
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        backend.save("user session!", b"bytes").unwrap();
        // Path uses the sanitized stem.
        assert!(dir.path().join("user_session_.wsnd").exists());
        assert_eq!(backend.load("user session!").unwrap().unwrap(), b"bytes");
        backend.delete("user session!").unwrap();
        assert_eq!(backend.load("user session!").unwrap(), None);
    }
}
