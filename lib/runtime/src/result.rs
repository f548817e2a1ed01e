use serde::{Deserialize, Serialize};

/// Deadline exceeded.
pub const EXIT_TIMEOUT: i32 = 124;
/// Explicitly cancelled.
pub const EXIT_CANCELLED: i32 = 125;
/// Missing tool or guest trap.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Why a run was terminated by the host rather than the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Timeout,
    Cancelled,
    Oom,
    Limit,
}

/// Which output streams hit their byte limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncated {
    pub stdout: bool,
    pub stderr: bool,
}

impl Truncated {
    pub fn any(&self) -> bool {
        self.stdout || self.stderr
    }
}

/// Result of one top-level run or spawn, with stdio decoded lossily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<Truncated>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl RunResult {
    pub fn from_outcome(outcome: crate::SpawnOutcome) -> Self {
        RunResult {
            exit_code: outcome.exit_code,
            stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
            execution_time_ms: outcome.execution_time_ms,
            truncated: outcome.truncated.any().then_some(outcome.truncated),
            error_class: outcome.error_class,
        }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        RunResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: message.into(),
            execution_time_ms: 0,
            truncated: None,
            error_class: Some(ErrorClass::Limit),
        }
    }

    pub fn cancelled() -> Self {
        RunResult {
            exit_code: EXIT_CANCELLED,
            stdout: String::new(),
            stderr: String::new(),
            execution_time_ms: 0,
            truncated: None,
            error_class: Some(ErrorClass::Cancelled),
        }
    }

    pub fn timeout(execution_time_ms: u64) -> Self {
        RunResult {
            exit_code: EXIT_TIMEOUT,
            stdout: String::new(),
            stderr: String::new(),
            execution_time_ms,
            truncated: None,
            error_class: Some(ErrorClass::Timeout),
        }
    }
}
