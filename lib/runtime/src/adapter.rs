use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use dashmap::DashMap;
use thiserror::Error;
use wasmer::{Engine, Module};

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("module not found: {0}")]
    NotFound(String),
    #[error("failed to read module {0}: {1}")]
    Read(String, String),
    #[error("failed to compile module {0}: {1}")]
    Compile(String, String),
}

/// Where `.wasm` binaries come from: a directory on the host, or an
/// in-memory bundle handed over at construction.
pub enum ModuleSource {
    Dir(PathBuf),
    Bundle(HashMap<String, Vec<u8>>),
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Dir(dir) => f.debug_tuple("Dir").field(dir).finish(),
            ModuleSource::Bundle(map) => f
                .debug_struct("Bundle")
                .field("modules", &map.len())
                .finish(),
        }
    }
}

/// Engine plus compiled-module cache.
///
/// The cache is keyed by the physical module location; compiled modules
/// are immutable and cheap to clone, so one adapter can be shared by
/// every sandbox in the process.
#[derive(Debug)]
pub struct PlatformAdapter {
    engine: Engine,
    source: ModuleSource,
    cache: DashMap<String, Module>,
}

impl PlatformAdapter {
    pub fn new(source: ModuleSource) -> Self {
        PlatformAdapter {
            engine: Engine::default(),
            source,
            cache: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Resolve and compile `location`, hitting the cache on repeat loads.
    pub fn load(&self, location: &str) -> Result<Module, AdapterError> {
        if let Some(module) = self.cache.get(location) {
            return Ok(module.clone());
        }
        let bytes = match &self.source {
            ModuleSource::Dir(dir) => std::fs::read(dir.join(location))
                .map_err(|e| AdapterError::Read(location.to_string(), e.to_string()))?,
            ModuleSource::Bundle(map) => map
                .get(location)
                .cloned()
                .ok_or_else(|| AdapterError::NotFound(location.to_string()))?,
        };
        tracing::debug!(location, bytes = bytes.len(), "compiling module");
        let module = Module::new(&self.engine, &bytes)
            .map_err(|e| AdapterError::Compile(location.to_string(), e.to_string()))?;
        self.cache.insert(location.to_string(), module.clone());
        Ok(module)
    }

    /// Pre-compile and pin a module under a location key, bypassing the
    /// source. Used for tools registered at runtime with inline bytes.
    pub fn preload(&self, location: &str, bytes: &[u8]) -> Result<Module, AdapterError> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| AdapterError::Compile(location.to_string(), e.to_string()))?;
        self.cache.insert(location.to_string(), module.clone());
        Ok(module)
    }
}
