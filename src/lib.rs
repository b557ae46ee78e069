//! Sandboxed code execution engine
//!
//! Compiles and runs untrusted submissions inside `isolate` boxes under a
//! validated resource policy and reports typed outcomes.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod languages;
pub mod outcome;
pub mod sandbox;
pub mod verdict;

pub use config::{EngineConfig, Environment, SystemCeilings};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use executor::{Executor, Submission, SubmissionResult, TestCase, TestResult};
pub use languages::{LanguageRegistry, LanguageSpec};
pub use outcome::{CompileOutcome, RunOutcome, RunStatus, COMPILE_TIMEOUT_MESSAGE};
pub use sandbox::{CellState, PolicyRequest, ResourcePolicy, SandboxCell};
pub use verdict::Verdict;
