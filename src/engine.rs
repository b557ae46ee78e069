//! Shared engine state
//!
//! One `Engine` per process: the immutable configuration, the box id pool and
//! the isolate driver. Cheap to clone; every clone hands out cells from the
//! same pool.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::sandbox::{BoxPool, Invocation, IsolateCli, IsolateDriver, SandboxCell};

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    pool: BoxPool,
    driver: Arc<dyn IsolateDriver>,
}

impl Engine {
    /// Engine backed by the isolate binary named in the configuration
    pub fn new(config: EngineConfig) -> Self {
        let driver = Arc::new(IsolateCli::new(&config.isolate_path));
        Self::with_driver(config, driver)
    }

    pub fn with_driver(config: EngineConfig, driver: Arc<dyn IsolateDriver>) -> Self {
        let pool = BoxPool::new(config.box_id_start, config.box_id_count);
        Self {
            config: Arc::new(config),
            pool,
            driver,
        }
    }

    /// A fresh cell in the `Created` state
    pub fn cell(&self) -> SandboxCell {
        SandboxCell::new(
            Arc::clone(&self.config),
            self.pool.clone(),
            Arc::clone(&self.driver),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &BoxPool {
        &self.pool
    }

    /// Check that isolate can be executed at all
    pub async fn probe(&self) -> Result<String> {
        let output = self
            .driver
            .invoke(Invocation::new(
                vec!["--version".to_string()],
                Duration::from_secs(10),
            ))
            .await?;

        if !output.success() {
            return Err(EngineError::Unavailable(
                output.stderr_lossy().trim().to_string(),
            ));
        }

        let version = output
            .stdout_lossy()
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        info!("Using {} ({:?})", version, self.config.isolate_path);
        Ok(version)
    }
}
