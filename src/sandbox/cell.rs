//! Sandbox cell
//!
//! One isolate box for one submission: `init` once, `compile` at most once,
//! `run` once per test case, `cleanup` exactly once on every exit path.
//!
//! Workspace layout returned by `isolate --init`:
//!
//! ```text
//! <workdir>/metadata.txt   isolate -M report, truncated after every phase
//! <workdir>/stdin.txt      current test case input
//! <workdir>/stdout.txt
//! <workdir>/stderr.txt
//! <workdir>/box/<source>   submission source
//! <workdir>/box/compile.sh rendered compile template (removed after compile)
//! <workdir>/box/run.sh     rendered run template
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, error, info, warn};

use super::box_pool::{BoxLease, BoxPool};
use super::driver::{Invocation, IsolateDriver};
use super::meta::{self, IsolateStatus, RawMetadata, RunMetrics};
use super::policy::{resolve, ResolvedLimits, ResourcePolicy};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::languages::LanguageSpec;
use crate::outcome::{CompileOutcome, RunOutcome, COMPILE_TIMEOUT_MESSAGE};

const BOX_DIR: &str = "box";
const COMPILE_SCRIPT: &str = "compile.sh";
const RUN_SCRIPT: &str = "run.sh";
const METADATA_FILE: &str = "metadata.txt";
const STDIN_FILE: &str = "stdin.txt";
const STDOUT_FILE: &str = "stdout.txt";
const STDERR_FILE: &str = "stderr.txt";

/// Upper bound for `--init` / `--cleanup`, which do no user work
const BOX_LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Created,
    Initialized,
    Compiled,
    /// Compile finished unsuccessfully; the cell can only be cleaned up
    CompileFailed,
    /// An isolate call failed or was cancelled mid-flight; only cleanup is allowed
    Contaminated,
    Cleaned,
}

impl CellState {
    pub fn as_str(self) -> &'static str {
        match self {
            CellState::Created => "created",
            CellState::Initialized => "initialized",
            CellState::Compiled => "compiled",
            CellState::CompileFailed => "compile_failed",
            CellState::Contaminated => "contaminated",
            CellState::Cleaned => "cleaned",
        }
    }
}

/// Artifact paths inside one box workspace
#[derive(Debug, Clone, PartialEq)]
pub struct CellPaths {
    pub workdir: PathBuf,
    pub boxdir: PathBuf,
    pub source: PathBuf,
    pub compile_script: PathBuf,
    pub run_script: PathBuf,
    pub metadata: PathBuf,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl CellPaths {
    fn new(workdir: PathBuf, source_file: &str) -> Self {
        let boxdir = workdir.join(BOX_DIR);
        Self {
            source: boxdir.join(source_file),
            compile_script: boxdir.join(COMPILE_SCRIPT),
            run_script: boxdir.join(RUN_SCRIPT),
            metadata: workdir.join(METADATA_FILE),
            stdin: workdir.join(STDIN_FILE),
            stdout: workdir.join(STDOUT_FILE),
            stderr: workdir.join(STDERR_FILE),
            boxdir,
            workdir,
        }
    }
}

/// Everything that only exists once `init` has claimed a box
struct Workspace {
    lease: BoxLease,
    limits: ResolvedLimits,
    language: Arc<LanguageSpec>,
    paths: Option<CellPaths>,
    /// isolate may have created the box; cleanup must tear it down
    box_created: bool,
}

pub struct SandboxCell {
    config: Arc<EngineConfig>,
    pool: BoxPool,
    driver: Arc<dyn IsolateDriver>,
    state: CellState,
    workspace: Option<Workspace>,
}

impl SandboxCell {
    pub fn new(config: Arc<EngineConfig>, pool: BoxPool, driver: Arc<dyn IsolateDriver>) -> Self {
        Self {
            config,
            pool,
            driver,
            state: CellState::Created,
            workspace: None,
        }
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn box_id(&self) -> Option<u32> {
        self.workspace.as_ref().map(|ws| ws.lease.id())
    }

    pub fn paths(&self) -> Option<&CellPaths> {
        self.workspace.as_ref().and_then(|ws| ws.paths.as_ref())
    }

    pub fn cgroups_enabled(&self) -> Option<bool> {
        self.workspace.as_ref().map(|ws| ws.limits.cgroups_enabled)
    }

    fn expect_state(&self, op: &'static str, expected: CellState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                op,
                state: self.state.as_str(),
            })
        }
    }

    fn workspace(&self, op: &'static str) -> Result<(&Workspace, &CellPaths)> {
        let invalid = || EngineError::InvalidState {
            op,
            state: self.state.as_str(),
        };
        let ws = self.workspace.as_ref().ok_or_else(invalid)?;
        let paths = ws.paths.as_ref().ok_or_else(invalid)?;
        Ok((ws, paths))
    }

    fn box_args(box_id: u32) -> Vec<String> {
        vec!["-b".to_string(), box_id.to_string()]
    }

    /// Claim a box id, create the isolate box and materialize the workspace.
    ///
    /// The policy is checked before any box id is taken. On failure the box
    /// id stays held until [`cleanup`](Self::cleanup).
    pub async fn init(
        &mut self,
        policy: &ResourcePolicy,
        language: Arc<LanguageSpec>,
        source: &str,
        command_line_arguments: &str,
    ) -> Result<()> {
        self.expect_state("init", CellState::Created)?;

        let limits = resolve(policy, &self.config.ceilings)?;
        let lease = self.pool.acquire().await?;
        let box_id = lease.id();

        let mut args = Self::box_args(box_id);
        args.push("--init".to_string());
        args.extend(limits.box_args());
        let cgroups_enabled = limits.cgroups_enabled;

        self.workspace = Some(Workspace {
            lease,
            limits,
            language: Arc::clone(&language),
            paths: None,
            box_created: true,
        });
        self.state = CellState::Contaminated;

        let output = self
            .driver
            .invoke(Invocation::new(args, BOX_LIFECYCLE_TIMEOUT))
            .await?;

        if !output.success() {
            if let Some(ws) = self.workspace.as_mut() {
                ws.box_created = false;
            }
            return Err(EngineError::Init {
                box_id,
                reason: output.stderr_lossy().trim().to_string(),
            });
        }

        let workdir = output.stdout_lossy().trim().to_string();
        if workdir.is_empty() {
            return Err(EngineError::Init {
                box_id,
                reason: "isolate did not report a box directory".to_string(),
            });
        }

        let paths = CellPaths::new(PathBuf::from(workdir), &language.source_file);
        info!(
            "Initialized isolate box {} at {:?} (cgroups: {})",
            box_id, paths.workdir, cgroups_enabled
        );

        write_file(&paths.source, source.as_bytes(), 0o644).await?;
        write_file(&paths.metadata, b"", 0o644).await?;
        write_file(&paths.stdin, b"", 0o644).await?;
        write_file(
            &paths.run_script,
            language.run_script(command_line_arguments).as_bytes(),
            0o755,
        )
        .await?;

        if let Some(ws) = self.workspace.as_mut() {
            ws.paths = Some(paths);
        }
        self.state = CellState::Initialized;
        Ok(())
    }

    /// Compile the submission with the operator's compile budget.
    ///
    /// A non-zero compiler exit is an unsuccessful outcome, not an error.
    pub async fn compile(&mut self, compiler_options: &str) -> Result<CompileOutcome> {
        self.expect_state("compile", CellState::Initialized)?;
        let (ws, paths) = self.workspace("compile")?;

        let Some(script) = ws.language.compile_script(compiler_options) else {
            debug!("{} has no compile step", ws.language.id);
            self.state = CellState::Compiled;
            return Ok(CompileOutcome::skipped());
        };

        write_file(&paths.compile_script, script.as_bytes(), 0o755).await?;

        let box_id = ws.lease.id();
        let mut args = Self::box_args(box_id);
        args.extend(ws.limits.compile_args(&paths.metadata));
        args.extend(run_script_args(COMPILE_SCRIPT));
        let timeout = outer_timeout(ws.limits.ceilings.max_wall_time_limit, &self.config);
        let metadata_path = paths.metadata.clone();
        let compile_script = paths.compile_script.clone();

        self.state = CellState::Contaminated;
        let output = self.driver.invoke(Invocation::new(args, timeout)).await?;

        let meta = read_metadata(&metadata_path).await?;
        reset_metadata(&metadata_path).await?;
        remove_if_exists(&compile_script).await?;
        debug!("Compile metadata for box {}: {:?}", box_id, meta);

        // isolate exits 1 whenever the program fails; the real code is in the report
        let reported = meta.get("exitcode").and_then(|v| match v.trim().parse::<i32>() {
            Ok(code) => Some(code),
            Err(_) => {
                warn!("Box {}: unparsable exitcode {:?} in compile report", box_id, v);
                None
            }
        });
        let exit_code = reported.or(output.exit_code).unwrap_or(-1);
        let status = IsolateStatus::from_meta(&meta).unwrap_or_else(|e| {
            warn!("Box {}: {}", box_id, e);
            IsolateStatus::InternalError
        });
        if status == IsolateStatus::InternalError {
            warn!("isolate reported an internal error while compiling in box {}", box_id);
        }

        let timed_out = status == IsolateStatus::TimeOut;
        let outcome = if timed_out {
            CompileOutcome {
                succeeded: false,
                timed_out: true,
                output: COMPILE_TIMEOUT_MESSAGE.to_string(),
                exit_code,
            }
        } else {
            let mut combined = output.stdout_lossy();
            combined.push_str(&output.stderr_lossy());
            CompileOutcome {
                succeeded: exit_code == 0 && status != IsolateStatus::InternalError,
                timed_out: false,
                output: combined,
                exit_code,
            }
        };

        self.state = if outcome.succeeded {
            CellState::Compiled
        } else {
            CellState::CompileFailed
        };
        info!(
            "Compiled in box {}: succeeded={} exit_code={}",
            box_id, outcome.succeeded, exit_code
        );
        Ok(outcome)
    }

    /// Run the compiled program once against `stdin`.
    pub async fn run(&mut self, stdin: &str) -> Result<RunOutcome> {
        self.expect_state("run", CellState::Compiled)?;
        let (ws, paths) = self.workspace("run")?;

        // Nothing from a previous test case may leak into this one.
        write_file(&paths.stdin, stdin.as_bytes(), 0o644).await?;
        reset_metadata(&paths.metadata).await?;

        let box_id = ws.lease.id();
        let mut args = Self::box_args(box_id);
        args.extend(ws.limits.run_args(&paths.metadata));
        args.extend(run_script_args(RUN_SCRIPT));
        let timeout = outer_timeout(ws.limits.policy.wall_time_limit, &self.config);
        let memory_key = ws.limits.memory_key();
        let metadata_path = paths.metadata.clone();
        let stdout_path = paths.stdout.clone();
        let stderr_path = paths.stderr.clone();

        self.state = CellState::Contaminated;
        let output = self
            .driver
            .invoke(Invocation::new(args, timeout).with_stdin(stdin.as_bytes()))
            .await?;

        let meta = read_metadata(&metadata_path).await?;
        reset_metadata(&metadata_path).await?;
        write_file(&stdout_path, &output.stdout, 0o644).await?;
        write_file(&stderr_path, &output.stderr, 0o644).await?;
        debug!(
            "Run metadata for box {} (isolate exit {:?}): {:?}",
            box_id, output.exit_code, meta
        );

        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        let outcome = match RunMetrics::from_meta(&meta, memory_key) {
            Ok(metrics) => RunOutcome::from_metrics(metrics, stdout, stderr),
            Err(e) => {
                let err = EngineError::Decode(e);
                warn!("Box {}: {}", box_id, err);
                RunOutcome::sandbox_error(err.to_string(), stdout, stderr)
            }
        };

        self.state = CellState::Compiled;
        Ok(outcome)
    }

    /// Tear down the box and release the box id. Safe to call in any state
    /// and more than once; a failed teardown still releases the id.
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.state == CellState::Cleaned {
            debug!("Cleanup on an already cleaned cell");
            return Ok(());
        }
        self.state = CellState::Cleaned;

        let Some(ws) = self.workspace.take() else {
            return Ok(());
        };
        let box_id = ws.lease.id();

        let result = if ws.box_created {
            let mut args = Self::box_args(box_id);
            args.push("--cleanup".to_string());
            args.extend(ws.limits.box_args());

            match self
                .driver
                .invoke(Invocation::new(args, BOX_LIFECYCLE_TIMEOUT))
                .await
            {
                Ok(output) if output.success() => Ok(()),
                Ok(output) => Err(EngineError::Cleanup {
                    box_id,
                    reason: output.stderr_lossy().trim().to_string(),
                }),
                Err(e) => Err(EngineError::Cleanup {
                    box_id,
                    reason: e.to_string(),
                }),
            }
        } else {
            Ok(())
        };

        match &result {
            Ok(()) => info!("Cleaned up isolate box {}", box_id),
            Err(e) => error!("Box workspace may be leaked on the host: {}", e),
        }

        drop(ws);
        result
    }
}

impl Drop for SandboxCell {
    fn drop(&mut self) {
        if let Some(ws) = self.workspace.take() {
            if ws.box_created {
                error!(
                    "Sandbox cell for box {} dropped without cleanup (state: {})",
                    ws.lease.id(),
                    self.state.as_str()
                );
                ws.lease.quarantine();
            }
        }
    }
}

fn run_script_args(script: &str) -> [String; 4] {
    [
        "--run".to_string(),
        "--".to_string(),
        "/bin/bash".to_string(),
        script.to_string(),
    ]
}

fn outer_timeout(wall_time_secs: f64, config: &EngineConfig) -> Duration {
    Duration::from_secs_f64((wall_time_secs + config.driver_grace_secs).max(0.0))
}

async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents)
        .await
        .map_err(|e| EngineError::io(path, e))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| EngineError::io(path, e))
}

async fn read_metadata(path: &Path) -> Result<RawMetadata> {
    match fs::read(path).await {
        Ok(content) => Ok(meta::decode(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RawMetadata::new()),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

async fn reset_metadata(path: &Path) -> Result<()> {
    fs::write(path, b"")
        .await
        .map_err(|e| EngineError::io(path, e))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io(path, e)),
    }
}
