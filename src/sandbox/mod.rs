//! Sandbox module - everything that touches isolate
//!
//! This module provides:
//! - Resource policy validation and isolate flag rendering
//! - Metadata decoding
//! - Box id allocation
//! - The process driver seam around the isolate binary
//! - The per-submission `SandboxCell` state machine
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the executor's job)
//! - Compare outputs

pub mod box_pool;
pub mod cell;
pub mod driver;
pub mod meta;
pub mod policy;
pub mod sanitize;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use box_pool::{BoxLease, BoxPool};
pub use cell::{CellPaths, CellState, SandboxCell};
pub use driver::{Invocation, IsolateCli, IsolateDriver, ProcessOutput, StdinSource};
pub use meta::{DecodeError, IsolateStatus, MemoryKey, RawMetadata, RunMetrics};
pub use policy::{resolve, PolicyRequest, PolicyViolation, ResolvedLimits, ResourcePolicy};
pub use sanitize::{sanitize, sanitize_str};
