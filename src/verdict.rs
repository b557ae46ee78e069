use serde::{Deserialize, Serialize};
use std::fmt;

use crate::outcome::{RunOutcome, RunStatus};

/// Verdict for one test case or a whole submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    SystemError,
    CompileError,
}

impl Verdict {
    /// Judge one run. `expected` is `None` when the caller only wants the
    /// program executed; `memory_limit` is in KB.
    pub fn judge(outcome: &RunOutcome, expected: Option<&str>, memory_limit: u64) -> Self {
        match outcome.status {
            RunStatus::SandboxError => Verdict::SystemError,
            RunStatus::TimedOut => Verdict::TimeLimitExceeded,
            _ if outcome.memory_used > memory_limit => Verdict::MemoryLimitExceeded,
            RunStatus::RuntimeError | RunStatus::Signaled => Verdict::RuntimeError,
            RunStatus::Ok if outcome.exit_code != 0 => Verdict::RuntimeError,
            RunStatus::Ok => match expected {
                Some(expected) if !compare_output(&outcome.stdout, expected) => {
                    Verdict::WrongAnswer
                }
                _ => Verdict::Accepted,
            },
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::MemoryLimitExceeded => "memory_limit_exceeded",
            Verdict::RuntimeError => "runtime_error",
            Verdict::SystemError => "system_error",
            Verdict::CompileError => "compile_error",
        };
        write!(f, "{}", s)
    }
}

/// Compare program output with expected output
pub fn compare_output(actual: &str, expected: &str) -> bool {
    // Trailing whitespace per line and trailing blank lines are not significant
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}
