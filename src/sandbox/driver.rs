//! Process driver
//!
//! The only place that spawns isolate. Everything above this seam builds
//! argument vectors and interprets output, so it can be exercised against a
//! scripted driver without a real sandbox.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Where the spawned process reads stdin from
#[derive(Debug, Clone, Default)]
pub enum StdinSource {
    #[default]
    Null,
    Bytes(Vec<u8>),
}

/// One call of the isolate binary
#[derive(Debug, Clone)]
pub struct Invocation {
    pub args: Vec<String>,
    pub stdin: StdinSource,
    /// Outer timeout; isolate enforces its own limits well before this
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(args: Vec<String>, timeout: Duration) -> Self {
        Self {
            args,
            stdin: StdinSource::Null,
            timeout,
        }
    }

    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = StdinSource::Bytes(bytes.into());
        self
    }
}

/// Captured result of an invocation
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when isolate itself was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Port for executing isolate
#[async_trait]
pub trait IsolateDriver: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<ProcessOutput>;
}

/// Drives the installed isolate binary
#[derive(Debug, Clone)]
pub struct IsolateCli {
    binary: PathBuf,
}

impl IsolateCli {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl IsolateDriver for IsolateCli {
    async fn invoke(&self, invocation: Invocation) -> Result<ProcessOutput> {
        debug!("Running {:?} with args: {:?}", self.binary, invocation.args);

        let mut cmd = Command::new(&self.binary);
        cmd.args(&invocation.args)
            .stdin(match invocation.stdin {
                StdinSource::Null => Stdio::null(),
                StdinSource::Bytes(_) => Stdio::piped(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: self.binary.display().to_string(),
            source,
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        // Feed stdin from its own task so a program that floods stdout
        // before reading input cannot deadlock us.
        if let (StdinSource::Bytes(bytes), Some(mut stdin)) = (invocation.stdin, child.stdin.take())
        {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!("stdin closed early: {}", e);
                }
            });
        }

        let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await
        {
            Ok(result) => result.map_err(|source| EngineError::Spawn {
                program: self.binary.display().to_string(),
                source,
            })?,
            Err(_) => {
                warn!(
                    "{:?} exceeded outer timeout of {:?}, killing process group",
                    self.binary, invocation.timeout
                );
                return Err(EngineError::DriverTimeout {
                    secs: invocation.timeout.as_secs_f64(),
                });
            }
        };
        group.disarm();

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Kills the whole process group of an in-flight invocation when dropped.
/// Dropping the `invoke` future (caller-side cancellation or outer timeout)
/// therefore takes every descendant of isolate down with it.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                debug!("killpg({}) failed: {}", pgid, e);
            }
        }
    }
}
