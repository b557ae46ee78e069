//! Typed results of the compile and run phases

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sandbox::meta::{IsolateStatus, RunMetrics};

/// Message reported instead of compiler output when the compile phase hits
/// its own time limit
pub const COMPILE_TIMEOUT_MESSAGE: &str = "Compilation time limit exceeded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub succeeded: bool,
    /// The compiler was killed for exceeding the compile budget
    pub timed_out: bool,
    /// Compiler stdout and stderr, or [`COMPILE_TIMEOUT_MESSAGE`]
    pub output: String,
    pub exit_code: i32,
}

impl CompileOutcome {
    /// Outcome for languages without a compile step
    pub fn skipped() -> Self {
        Self {
            succeeded: true,
            timed_out: false,
            output: String::new(),
            exit_code: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    TimedOut,
    RuntimeError,
    Signaled,
    /// isolate misbehaved or its report could not be decoded
    SandboxError,
}

impl From<IsolateStatus> for RunStatus {
    fn from(status: IsolateStatus) -> Self {
        match status {
            IsolateStatus::Ok => RunStatus::Ok,
            IsolateStatus::TimeOut => RunStatus::TimedOut,
            IsolateStatus::RuntimeError => RunStatus::RuntimeError,
            IsolateStatus::Signal => RunStatus::Signaled,
            IsolateStatus::InternalError => RunStatus::SandboxError,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Ok => "ok",
            RunStatus::TimedOut => "timed_out",
            RunStatus::RuntimeError => "runtime_error",
            RunStatus::Signaled => "signaled",
            RunStatus::SandboxError => "sandbox_error",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one run of the compiled program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    /// CPU time in seconds
    pub cpu_time: f64,
    /// Wall clock time in seconds
    pub wall_time: f64,
    /// Peak memory in KB
    pub memory_used: u64,
    pub exit_code: i32,
    pub exit_signal: i32,
    /// isolate's message, or why the report could not be trusted
    pub message: Option<String>,
}

impl RunOutcome {
    pub fn from_metrics(metrics: RunMetrics, stdout: String, stderr: String) -> Self {
        Self {
            status: metrics.status.into(),
            stdout,
            stderr,
            cpu_time: metrics.time,
            wall_time: metrics.wall_time,
            memory_used: metrics.memory_kb,
            exit_code: metrics.exit_code,
            exit_signal: metrics.exit_signal,
            message: metrics.message,
        }
    }

    /// A run whose measurements cannot be trusted. Numeric fields are zero
    /// and must not be read as usage; `status` says so.
    pub fn sandbox_error(message: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            status: RunStatus::SandboxError,
            stdout,
            stderr,
            cpu_time: 0.0,
            wall_time: 0.0,
            memory_used: 0,
            exit_code: 0,
            exit_signal: 0,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Ok && self.exit_code == 0
    }
}
