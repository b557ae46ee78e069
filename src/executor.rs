//! Execution orchestrator
//!
//! Drives one submission through a sandbox cell: init, compile, one run per
//! test case. The cell is cleaned up on every exit path, including errors.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::languages::{LanguageRegistry, LanguageSpec};
use crate::outcome::{RunOutcome, RunStatus};
use crate::sandbox::{PolicyRequest, ResourcePolicy, SandboxCell};
use crate::verdict::Verdict;

/// Submission as received from a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub id: Option<String>,
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub compiler_options: String,
    #[serde(default)]
    pub command_line_arguments: String,
    /// Resource limits; unset fields fall back to the operator defaults
    #[serde(default)]
    pub limits: PolicyRequest,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    /// Source, stdin and expected output are base64, and outputs are returned
    /// base64 as well
    #[serde(default)]
    pub base64_encoded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub stdin: String,
    /// Without an expected output the run is only checked for a clean exit
    #[serde(default)]
    pub expected_output: Option<String>,
}

/// Result of judging a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    /// Largest CPU time over all test cases, in seconds
    pub time: f64,
    pub wall_time: f64,
    /// Largest peak memory over all test cases, in KB
    pub memory: u64,
    pub test_results: Vec<TestResult>,
    pub base64_encoded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub verdict: Verdict,
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub time: f64,
    pub wall_time: f64,
    pub memory: u64,
    pub exit_code: i32,
    pub exit_signal: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestResult {
    fn new(verdict: Verdict, outcome: RunOutcome) -> Self {
        Self {
            verdict,
            status: outcome.status,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            time: outcome.cpu_time,
            wall_time: outcome.wall_time,
            memory: outcome.memory_used,
            exit_code: outcome.exit_code,
            exit_signal: outcome.exit_signal,
            message: outcome.message,
        }
    }
}

impl SubmissionResult {
    fn encode_outputs(&mut self) {
        let encode = |s: &mut String| *s = STANDARD.encode(s.as_bytes());
        if let Some(output) = self.compile_output.as_mut() {
            encode(output);
        }
        for test in &mut self.test_results {
            encode(&mut test.stdout);
            encode(&mut test.stderr);
        }
        self.base64_encoded = true;
    }
}

/// Plain-text view of a submission's payload
struct Inputs {
    source: String,
    cases: Vec<TestCase>,
}

impl Inputs {
    fn from_submission(submission: &Submission) -> Result<Self> {
        let decode = |value: &str, what: &str| -> Result<String> {
            if !submission.base64_encoded {
                return Ok(value.to_string());
            }
            let bytes = STANDARD
                .decode(value.trim())
                .with_context(|| format!("{} is not valid base64", what))?;
            String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", what))
        };

        let source = decode(&submission.source_code, "source_code")?;
        let mut cases = Vec::with_capacity(submission.test_cases.len());
        for (i, case) in submission.test_cases.iter().enumerate() {
            cases.push(TestCase {
                stdin: decode(&case.stdin, &format!("test case {} stdin", i))?,
                expected_output: case
                    .expected_output
                    .as_deref()
                    .map(|e| decode(e, &format!("test case {} expected_output", i)))
                    .transpose()?,
            });
        }

        // Nothing to judge against: run once to report what the program does
        if cases.is_empty() {
            cases.push(TestCase::default());
        }

        Ok(Self { source, cases })
    }
}

pub struct Executor {
    engine: Engine,
    languages: Arc<LanguageRegistry>,
}

impl Executor {
    pub fn new(engine: Engine, languages: Arc<LanguageRegistry>) -> Self {
        Self { engine, languages }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Judge a submission end to end
    pub async fn execute(&self, submission: &Submission) -> Result<SubmissionResult> {
        let language = self
            .languages
            .get(&submission.language)
            .ok_or_else(|| EngineError::UnknownLanguage(submission.language.clone()))?;
        let policy = submission.limits.with_defaults(&self.engine.config().defaults);
        let inputs = Inputs::from_submission(submission)?;

        let mut cell = self.engine.cell();
        let result = judge(&mut cell, submission, &inputs, language, &policy).await;

        // A failed teardown is logged by the cell and does not void the verdict.
        if cell.cleanup().await.is_err() {
            warn!(
                "Submission {:?} finished but its box was not torn down",
                submission.id
            );
        }

        let mut result = result.with_context(|| {
            format!("Failed to execute submission {:?}", submission.id)
        })?;
        result.id = submission.id.clone();
        if submission.base64_encoded {
            result.encode_outputs();
        }

        info!(
            "Submission summary: id={:?}, verdict={}, max_time={:.3}s, max_memory={}KB",
            result.id, result.verdict, result.time, result.memory
        );
        Ok(result)
    }
}

async fn judge(
    cell: &mut SandboxCell,
    submission: &Submission,
    inputs: &Inputs,
    language: Arc<LanguageSpec>,
    policy: &ResourcePolicy,
) -> crate::error::Result<SubmissionResult> {
    cell.init(
        policy,
        language,
        &inputs.source,
        &submission.command_line_arguments,
    )
    .await?;

    let compile = cell.compile(&submission.compiler_options).await?;
    let compile_output = Some(compile.output).filter(|o| !o.is_empty());

    let mut result = SubmissionResult {
        id: None,
        verdict: Verdict::Accepted,
        compile_output,
        time: 0.0,
        wall_time: 0.0,
        memory: 0,
        test_results: Vec::with_capacity(inputs.cases.len()),
        base64_encoded: false,
    };

    if !compile.succeeded {
        result.verdict = Verdict::CompileError;
        return Ok(result);
    }

    for case in &inputs.cases {
        let outcome = run_with_retry(cell, &case.stdin).await?;
        let verdict = Verdict::judge(&outcome, case.expected_output.as_deref(), policy.memory_limit);

        result.time = result.time.max(outcome.cpu_time);
        result.wall_time = result.wall_time.max(outcome.wall_time);
        result.memory = result.memory.max(outcome.memory_used);
        if result.verdict == Verdict::Accepted && verdict != Verdict::Accepted {
            result.verdict = verdict;
        }
        result.test_results.push(TestResult::new(verdict, outcome));
    }

    Ok(result)
}

/// A run whose report could not be trusted is retried once on the same box.
async fn run_with_retry(cell: &mut SandboxCell, stdin: &str) -> crate::error::Result<RunOutcome> {
    let outcome = cell.run(stdin).await?;
    if outcome.status != RunStatus::SandboxError {
        return Ok(outcome);
    }

    warn!(
        "Sandbox error in box {:?}: {}; retrying once",
        cell.box_id(),
        outcome.message.as_deref().unwrap_or("no message")
    );
    cell.run(stdin).await
}
