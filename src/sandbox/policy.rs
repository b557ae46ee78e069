//! Resource policy resolution
//!
//! Checks a submission's requested limits against the operator ceilings and
//! renders the isolate flag bundles for the compile and run phases. Nothing
//! is ever clamped: a request above a ceiling is rejected with the offending
//! field, because a silently lowered limit changes judging outcomes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::meta::MemoryKey;
use crate::config::SystemCeilings;

/// `PATH` handed to sandboxed processes
pub const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/usr/libexec:/bin";

/// Limits for a single submission. Times in seconds, sizes in KB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub cpu_time_limit: f64,
    pub cpu_extra_time: f64,
    pub wall_time_limit: f64,
    pub stack_limit: u64,
    pub memory_limit: u64,
    pub max_file_size: u64,
    pub max_processes_and_or_threads: u64,
    pub enable_per_process_and_thread_time_limit: bool,
    pub enable_per_process_and_thread_memory_limit: bool,
    pub enable_network: bool,
    pub redirect_stderr_to_stdout: bool,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            cpu_time_limit: 5.0,
            cpu_extra_time: 1.0,
            wall_time_limit: 10.0,
            stack_limit: 64_000,
            memory_limit: 128_000,
            max_file_size: 1024,
            max_processes_and_or_threads: 60,
            enable_per_process_and_thread_time_limit: false,
            enable_per_process_and_thread_memory_limit: false,
            enable_network: false,
            redirect_stderr_to_stdout: false,
        }
    }
}

/// Limits as a submitter sends them; anything left out falls back to the
/// operator defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRequest {
    pub cpu_time_limit: Option<f64>,
    pub cpu_extra_time: Option<f64>,
    pub wall_time_limit: Option<f64>,
    pub stack_limit: Option<u64>,
    pub memory_limit: Option<u64>,
    pub max_file_size: Option<u64>,
    pub max_processes_and_or_threads: Option<u64>,
    pub enable_per_process_and_thread_time_limit: Option<bool>,
    pub enable_per_process_and_thread_memory_limit: Option<bool>,
    pub enable_network: Option<bool>,
    pub redirect_stderr_to_stdout: Option<bool>,
}

impl PolicyRequest {
    pub fn with_defaults(&self, defaults: &ResourcePolicy) -> ResourcePolicy {
        ResourcePolicy {
            cpu_time_limit: self.cpu_time_limit.unwrap_or(defaults.cpu_time_limit),
            cpu_extra_time: self.cpu_extra_time.unwrap_or(defaults.cpu_extra_time),
            wall_time_limit: self.wall_time_limit.unwrap_or(defaults.wall_time_limit),
            stack_limit: self.stack_limit.unwrap_or(defaults.stack_limit),
            memory_limit: self.memory_limit.unwrap_or(defaults.memory_limit),
            max_file_size: self.max_file_size.unwrap_or(defaults.max_file_size),
            max_processes_and_or_threads: self
                .max_processes_and_or_threads
                .unwrap_or(defaults.max_processes_and_or_threads),
            enable_per_process_and_thread_time_limit: self
                .enable_per_process_and_thread_time_limit
                .unwrap_or(defaults.enable_per_process_and_thread_time_limit),
            enable_per_process_and_thread_memory_limit: self
                .enable_per_process_and_thread_memory_limit
                .unwrap_or(defaults.enable_per_process_and_thread_memory_limit),
            enable_network: self.enable_network.unwrap_or(defaults.enable_network),
            redirect_stderr_to_stdout: self
                .redirect_stderr_to_stdout
                .unwrap_or(defaults.redirect_stderr_to_stdout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyViolation {
    #[error("{field} = {requested} is outside [0, {ceiling}]")]
    Exceeds {
        field: &'static str,
        requested: f64,
        ceiling: f64,
    },

    /// isolate reads 0 as "no limit" on this axis
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },

    #[error("{field} is not allowed on this host")]
    NotAllowed { field: &'static str },
}

/// A policy that passed every ceiling check, ready to be rendered into flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLimits {
    pub policy: ResourcePolicy,
    pub ceilings: SystemCeilings,
    /// Control-group accounting is used unless both per-process time and
    /// per-process memory limits were requested.
    pub cgroups_enabled: bool,
}

/// Validate `requested` against `ceilings`.
pub fn resolve(
    requested: &ResourcePolicy,
    ceilings: &SystemCeilings,
) -> Result<ResolvedLimits, PolicyViolation> {
    limit("cpu_time_limit", requested.cpu_time_limit, ceilings.max_cpu_time_limit)?;
    within("cpu_extra_time", requested.cpu_extra_time, ceilings.max_cpu_extra_time)?;
    limit("wall_time_limit", requested.wall_time_limit, ceilings.max_wall_time_limit)?;
    limit(
        "stack_limit",
        requested.stack_limit as f64,
        ceilings.max_stack_limit as f64,
    )?;
    limit(
        "memory_limit",
        requested.memory_limit as f64,
        ceilings.max_memory_limit as f64,
    )?;
    limit(
        "max_file_size",
        requested.max_file_size as f64,
        ceilings.max_max_file_size as f64,
    )?;
    limit(
        "max_processes_and_or_threads",
        requested.max_processes_and_or_threads as f64,
        ceilings.max_max_processes_and_or_threads as f64,
    )?;

    allowed("enable_network", requested.enable_network, ceilings.allow_enable_network)?;
    allowed(
        "enable_per_process_and_thread_time_limit",
        requested.enable_per_process_and_thread_time_limit,
        ceilings.allow_enable_per_process_and_thread_time_limit,
    )?;
    allowed(
        "enable_per_process_and_thread_memory_limit",
        requested.enable_per_process_and_thread_memory_limit,
        ceilings.allow_enable_per_process_and_thread_memory_limit,
    )?;

    let cgroups_enabled = !(requested.enable_per_process_and_thread_memory_limit
        && requested.enable_per_process_and_thread_time_limit);

    Ok(ResolvedLimits {
        policy: requested.clone(),
        ceilings: ceilings.clone(),
        cgroups_enabled,
    })
}

fn within(field: &'static str, requested: f64, ceiling: f64) -> Result<(), PolicyViolation> {
    // NaN fails both comparisons.
    if requested >= 0.0 && requested <= ceiling {
        Ok(())
    } else {
        Err(PolicyViolation::Exceeds {
            field,
            requested,
            ceiling,
        })
    }
}

/// A limit isolate must actually enforce: within the ceiling and not 0.
fn limit(field: &'static str, requested: f64, ceiling: f64) -> Result<(), PolicyViolation> {
    within(field, requested, ceiling)?;
    if requested == 0.0 {
        return Err(PolicyViolation::Zero { field });
    }
    Ok(())
}

fn allowed(field: &'static str, requested: bool, allow: bool) -> Result<(), PolicyViolation> {
    if requested && !allow {
        Err(PolicyViolation::NotAllowed { field })
    } else {
        Ok(())
    }
}

fn environment_args() -> Vec<String> {
    vec![
        "-E".to_string(),
        "HOME=/tmp".to_string(),
        "-E".to_string(),
        format!("PATH={}", SANDBOX_PATH),
        "-E".to_string(),
        "LANG".to_string(),
        "-E".to_string(),
        "LANGUAGE".to_string(),
        "-E".to_string(),
        "LC_ALL".to_string(),
        "-d".to_string(),
        "/etc:noexec".to_string(),
    ]
}

impl ResolvedLimits {
    pub fn memory_key(&self) -> MemoryKey {
        MemoryKey::for_regime(self.cgroups_enabled)
    }

    /// Longest wall time isolate may legitimately take in either phase.
    pub fn wall_time_ceiling(&self) -> f64 {
        self.ceilings
            .max_wall_time_limit
            .max(self.policy.wall_time_limit)
    }

    /// Flags for `isolate --init` / `--cleanup`
    pub fn box_args(&self) -> Vec<String> {
        if self.cgroups_enabled {
            vec!["--cg".to_string()]
        } else {
            Vec::new()
        }
    }

    /// Compile phase: operator ceilings only, no network, stderr folded into
    /// stdout, stdin from `/dev/null`.
    pub fn compile_args(&self, meta_file: &Path) -> Vec<String> {
        let c = &self.ceilings;
        let mut args = vec![
            "-s".to_string(),
            "-M".to_string(),
            meta_file.display().to_string(),
            "--stderr-to-stdout".to_string(),
            "-i".to_string(),
            "/dev/null".to_string(),
            "-x".to_string(),
            "0".to_string(),
            "-t".to_string(),
            c.max_cpu_time_limit.to_string(),
            "-w".to_string(),
            c.max_wall_time_limit.to_string(),
            "--stack".to_string(),
            c.max_stack_limit.to_string(),
            "-f".to_string(),
            c.max_max_file_size.to_string(),
            format!("-p{}", c.max_max_processes_and_or_threads),
            format!("-m{}", c.max_memory_limit),
        ];
        args.extend(environment_args());
        args.extend(self.box_args());
        args
    }

    /// Run phase: the submission's own policy. `-s` keeps isolate's status
    /// line out of the program's captured stderr.
    pub fn run_args(&self, meta_file: &Path) -> Vec<String> {
        let p = &self.policy;
        let mut args = vec![
            "-s".to_string(),
            "-M".to_string(),
            meta_file.display().to_string(),
            "-t".to_string(),
            p.cpu_time_limit.to_string(),
            "-x".to_string(),
            p.cpu_extra_time.to_string(),
            "-w".to_string(),
            p.wall_time_limit.to_string(),
            "-k".to_string(),
            p.stack_limit.to_string(),
            "-f".to_string(),
            p.max_file_size.to_string(),
            format!("-p{}", p.max_processes_and_or_threads),
        ];
        args.extend(environment_args());
        args.extend(self.box_args());

        if p.redirect_stderr_to_stdout {
            args.push("--stderr-to-stdout".to_string());
        }
        if p.enable_network {
            args.push("--share-net".to_string());
        }

        if p.enable_per_process_and_thread_memory_limit {
            args.push(format!("-m{}", p.memory_limit));
        } else {
            args.push(format!("--cg-mem={}", p.memory_limit));
        }

        if p.enable_per_process_and_thread_time_limit {
            if self.cgroups_enabled {
                args.push("--no-cg-timing".to_string());
            }
        } else {
            args.push("--cg-timing".to_string());
        }

        args
    }
}
