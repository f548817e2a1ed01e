use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExtensionError {
    #[error("extension not found: {0}")]
    NotFound(String),
    #[error("extension handler failed: {0}")]
    HandlerError(String),
}

/// Invocation context a guest hands to `extension_call`.
#[derive(Debug, Clone, Default)]
pub struct ExtensionRequest {
    pub args: Vec<String>,
    pub stdin: String,
    pub env: Vec<(String, String)>,
    pub cwd: String,
}

/// What a command handler returns.
#[derive(Debug, Clone, Default)]
pub struct ExtensionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub type ExtensionHandler =
    Arc<dyn Fn(ExtensionRequest) -> ExtensionOutput + Send + Sync>;

/// A host-side extension: a synchronously callable command, a Python
/// package made importable inside the guest, or both.
#[derive(Clone)]
pub struct ExtensionConfig {
    pub name: String,
    pub command: Option<ExtensionHandler>,
    pub python_package: Option<String>,
}

impl fmt::Debug for ExtensionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionConfig")
            .field("name", &self.name)
            .field("command", &self.command.as_ref().map(|_| "<handler>"))
            .field("python_package", &self.python_package)
            .finish()
    }
}

/// Registry of host extensions exposed to guests by name.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    entries: DashMap<String, ExtensionConfig>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: ExtensionConfig) {
        tracing::debug!(name = %config.name, "registered extension");
        self.entries.insert(config.name.clone(), config);
    }

    /// Only command extensions are invokable from the shell.
    pub fn is_extension(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| e.command.is_some())
            .unwrap_or(false)
    }

    pub fn python_packages(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| e.python_package.clone())
            .collect()
    }

    pub fn invoke(
        &self,
        name: &str,
        request: ExtensionRequest,
    ) -> Result<ExtensionOutput, ExtensionError> {
        let handler = {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;
            entry
                .command
                .clone()
                .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?
        };
        catch_unwind(AssertUnwindSafe(|| handler(request)))
            .map_err(|_| ExtensionError::HandlerError(format!("{name}: handler panicked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upper_ext() -> ExtensionConfig {
        ExtensionConfig {
            name: "upper".to_string(),
            command: Some(Arc::new(|req: ExtensionRequest| ExtensionOutput {
                exit_code: 0,
                stdout: req.stdin.to_uppercase(),
                stderr: String::new(),
            })),
            python_package: None,
        }
    }

    #[test]
    fn invoke_runs_registered_handler() {
        let registry = ExtensionRegistry::new();
        registry.register(upper_ext());
        assert!(registry.is_extension("upper"));
        let out = registry
            .invoke(
                "upper",
                ExtensionRequest {
                    stdin: "hello".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out.stdout, "HELLO");
    }

    #[test]
    fn unknown_extension_is_not_found() {
        let registry = ExtensionRegistry::new();
        assert!(matches!(
            registry.invoke("nope", ExtensionRequest::default()),
            Err(ExtensionError::NotFound(_))
        ));
    }

    #[test]
    fn python_package_without_command_is_not_invokable() {
        let registry = ExtensionRegistry::new();
        registry.register(ExtensionConfig {
            name: "numpy".to_string(),
            command: None,
            python_package: Some("numpy".to_string()),
        });
        assert!(!registry.is_extension("numpy"));
        assert!(matches!(
            registry.invoke("numpy", ExtensionRequest::default()),
            Err(ExtensionError::NotFound(_))
        ));
        assert_eq!(registry.python_packages(), vec!["numpy".to_string()]);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let registry = ExtensionRegistry::new();
        registry.register(ExtensionConfig {
            name: "boom".to_string(),
            command: Some(Arc::new(|_| panic!("kaboom"))),
            python_package: None,
        });
        assert!(matches!(
            registry.invoke("boom", ExtensionRequest::default()),
            Err(ExtensionError::HandlerError(_))
        ));
    }
}
