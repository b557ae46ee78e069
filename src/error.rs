//! Engine error taxonomy
//!
//! Only conditions that stop a submission from being judged are errors.
//! A failed compile, a compile timeout and every `RunStatus` are outcomes and
//! travel inside `CompileOutcome` / `RunOutcome` instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::sandbox::meta::DecodeError;
use crate::sandbox::policy::PolicyViolation;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Requested resource policy is outside the operator ceilings
    #[error("policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// `isolate --init` failed or the box workspace could not be materialized
    #[error("failed to initialize box {box_id}: {reason}")]
    Init { box_id: u32, reason: String },

    /// Operation called out of order (e.g. `run` before a successful `compile`)
    #[error("cannot {op} while cell is {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// Every box id is held by a live cell
    #[error("no free box id available")]
    BoxPoolExhausted,

    /// The isolate binary could not be spawned or waited on
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// isolate itself did not return within the outer timeout
    #[error("isolate did not exit within {secs:.1}s")]
    DriverTimeout { secs: f64 },

    /// Metadata missing a field required by the reported status
    #[error("malformed isolate metadata: {0}")]
    Decode(#[from] DecodeError),

    /// `isolate --cleanup` failed; the workspace may be leaked on the host
    #[error("failed to clean up box {box_id}: {reason}")]
    Cleanup { box_id: u32, reason: String },

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `isolate --version` did not succeed
    #[error("isolate is unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported language: {0}")]
    UnknownLanguage(String),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
