use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSpec>,
}

impl CheckDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.command.is_empty() {
            return Err(DefinitionError::EmptyCommand {
                name: self.name.clone(),
            });
        }
        if let Some(timeout) = self.timeout.as_ref() {
            if timeout.ms == 0 {
                return Err(DefinitionError::ZeroTimeout {
                    name: self.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    EmptyName,
    EmptyCommand { name: String },
    ZeroTimeout { name: String },
}

impl std::fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionError::EmptyName => write!(f, "check name must not be empty"),
            DefinitionError::EmptyCommand { name } => {
                write!(f, "check `{name}` has an empty command")
            }
            DefinitionError::ZeroTimeout { name } => {
                write!(f, "check `{name}` has a timeout of 0ms")
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSpec {
    pub ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<KillSignal>,
    #[serde(
        default,
        rename = "killAfterMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub kill_after_ms: Option<u64>,
    #[serde(default, rename = "onTimeout", skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<TimeoutOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillSignal {
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGQUIT")]
    Quit,
    #[serde(rename = "SIGHUP")]
    Hup,
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl KillSignal {
    pub fn name(self) -> &'static str {
        match self {
            KillSignal::Term => "SIGTERM",
            KillSignal::Int => "SIGINT",
            KillSignal::Quit => "SIGQUIT",
            KillSignal::Hup => "SIGHUP",
            KillSignal::Kill => "SIGKILL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutOutcome {
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CheckResult {
    Pending,
    Running,
    Passed {
        #[serde(rename = "finishedAt")]
        finished_at_ms: u64,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Failed {
        #[serde(rename = "finishedAt")]
        finished_at_ms: u64,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(rename = "errorMessage")]
        error_message: Option<String>,
    },
    Aborted {
        #[serde(rename = "finishedAt")]
        finished_at_ms: u64,
    },
}

impl CheckResult {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckResult::Passed { .. } | CheckResult::Failed { .. } | CheckResult::Aborted { .. }
        )
    }

    pub fn finished_at_ms(&self) -> Option<u64> {
        match self {
            CheckResult::Passed { finished_at_ms, .. }
            | CheckResult::Failed { finished_at_ms, .. }
            | CheckResult::Aborted { finished_at_ms } => Some(*finished_at_ms),
            CheckResult::Pending | CheckResult::Running => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogStream,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub aborted: usize,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

pub fn combine_summaries(parts: &[Summary]) -> Summary {
    let mut combined = Summary::default();
    for part in parts {
        combined.total += part.total;
        combined.passed += part.passed;
        combined.failed += part.failed;
        combined.aborted += part.aborted;
        combined.duration_ms = combined.duration_ms.max(part.duration_ms);
    }
    combined
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub project: String,
    pub path: PathBuf,
    pub color: String,
    pub checks: Vec<CheckDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckId {
    pub project: usize,
    pub check: usize,
}

#[cfg(test)]
#[path = "tests/model_tests.rs"]
mod tests;
