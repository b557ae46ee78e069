//! Engine configuration
//!
//! Loaded once at startup from a TOML file and handed to [`crate::Engine`] by
//! value. Nothing here is global: tests build their own `EngineConfig` with
//! whatever ceilings they need.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sandbox::policy::{resolve, ResourcePolicy};

/// Highest box id isolate accepts
pub const MAX_BOX_ID: u32 = 999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// Operator maximums for every resource policy axis. Times in seconds, sizes
/// in KB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemCeilings {
    pub max_cpu_time_limit: f64,
    pub max_cpu_extra_time: f64,
    pub max_wall_time_limit: f64,
    pub max_stack_limit: u64,
    pub max_memory_limit: u64,
    pub max_max_file_size: u64,
    pub max_max_processes_and_or_threads: u64,
    pub allow_enable_network: bool,
    pub allow_enable_per_process_and_thread_time_limit: bool,
    pub allow_enable_per_process_and_thread_memory_limit: bool,
}

impl Default for SystemCeilings {
    fn default() -> Self {
        Self {
            max_cpu_time_limit: 15.0,
            max_cpu_extra_time: 5.0,
            max_wall_time_limit: 20.0,
            max_stack_limit: 128_000,
            max_memory_limit: 512_000,
            max_max_file_size: 4096,
            max_max_processes_and_or_threads: 120,
            allow_enable_network: true,
            allow_enable_per_process_and_thread_time_limit: true,
            allow_enable_per_process_and_thread_memory_limit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub environment: Environment,
    /// Path of the isolate binary
    pub isolate_path: PathBuf,
    /// First box id handed out by this process
    pub box_id_start: u32,
    /// Number of box ids this process may hold at once
    pub box_id_count: u32,
    /// Extra seconds granted on top of the wall-time ceiling before isolate
    /// itself is considered hung
    pub driver_grace_secs: f64,
    pub ceilings: SystemCeilings,
    /// Applied to every field a submission leaves unset
    pub defaults: ResourcePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            isolate_path: PathBuf::from("/usr/local/bin/isolate"),
            box_id_start: 0,
            box_id_count: 100,
            driver_grace_secs: 5.0,
            ceilings: SystemCeilings::default(),
            defaults: ResourcePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {:?}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid engine config {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.box_id_count == 0 {
            anyhow::bail!("box_id_count must be at least 1");
        }
        let last = self.box_id_start as u64 + self.box_id_count as u64 - 1;
        if last > MAX_BOX_ID as u64 {
            anyhow::bail!(
                "box ids {}..={} exceed isolate's maximum of {}",
                self.box_id_start,
                last,
                MAX_BOX_ID
            );
        }
        if !(self.driver_grace_secs >= 0.0) {
            anyhow::bail!("driver_grace_secs must be non-negative");
        }
        resolve(&self.defaults, &self.ceilings).context("defaults exceed the configured ceilings")?;
        Ok(())
    }
}
