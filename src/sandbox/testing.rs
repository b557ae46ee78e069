//! In-memory isolate stand-in for unit tests
//!
//! Boxes are plain directories under a temp root. `--run` calls answer from a
//! queue of scripted replies per script name; with nothing queued, a run
//! echoes its stdin and reports a clean exit.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use super::driver::{Invocation, IsolateDriver, ProcessOutput, StdinSource};
use crate::error::{EngineError, Result};

pub const CLEAN_META: &str = "time:0.010\ntime-wall:0.020\nmax-rss:2048\ncg-mem:1024\nexitcode:0\n";

#[derive(Debug, Clone)]
pub enum Reply {
    Complete {
        meta: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// isolate never came back
    Hang,
}

impl Reply {
    pub fn meta(meta: &str) -> Self {
        Reply::Complete {
            meta: meta.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn output(meta: &str, stdout: &str, exit_code: i32) -> Self {
        Reply::Complete {
            meta: meta.to_string(),
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
        }
    }
}

/// What the driver saw for one `--run` call
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub args: Vec<String>,
    pub stdin: Vec<u8>,
    /// Content of the script passed to `/bin/bash` at call time
    pub script: String,
}

#[derive(Default)]
struct State {
    replies: HashMap<String, VecDeque<Reply>>,
    runs: Vec<RecordedRun>,
    calls: Vec<Vec<String>>,
    fail_init: bool,
    fail_cleanup: bool,
}

pub struct ScriptedDriver {
    root: TempDir,
    state: Mutex<State>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn push_reply(&self, script: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .replies
            .entry(script.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn fail_init(&self) {
        self.state.lock().unwrap().fail_init = true;
    }

    pub fn fail_cleanup(&self) {
        self.state.lock().unwrap().fail_cleanup = true;
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.state.lock().unwrap().runs.clone()
    }

    /// Every argument vector received, in order
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn box_root(&self, box_id: u32) -> PathBuf {
        self.root.path().join(box_id.to_string())
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }
}

fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

#[async_trait]
impl IsolateDriver for ScriptedDriver {
    async fn invoke(&self, invocation: Invocation) -> Result<ProcessOutput> {
        let args = invocation.args;
        self.state.lock().unwrap().calls.push(args.clone());

        if args.iter().any(|a| a == "--version") {
            return Ok(exited(0, "The process isolator 2.0\n", ""));
        }

        let box_id: u32 = Self::value_after(&args, "-b")
            .and_then(|id| id.parse().ok())
            .expect("every isolate call names a box");
        let workdir = self.box_root(box_id);

        if args.iter().any(|a| a == "--init") {
            if self.state.lock().unwrap().fail_init {
                return Ok(exited(2, "", "Box already exists\n"));
            }
            std::fs::create_dir_all(workdir.join("box")).unwrap();
            return Ok(exited(0, &format!("{}\n", workdir.display()), ""));
        }

        if args.iter().any(|a| a == "--cleanup") {
            if self.state.lock().unwrap().fail_cleanup {
                return Ok(exited(1, "", "Cannot remove box\n"));
            }
            let _ = std::fs::remove_dir_all(&workdir);
            return Ok(exited(0, "", ""));
        }

        let script_name = args.last().cloned().unwrap_or_default();
        let script = std::fs::read_to_string(workdir.join("box").join(&script_name))
            .unwrap_or_default();
        let stdin = match invocation.stdin {
            StdinSource::Null => Vec::new(),
            StdinSource::Bytes(bytes) => bytes,
        };

        let reply = {
            let mut state = self.state.lock().unwrap();
            state.runs.push(RecordedRun {
                args: args.clone(),
                stdin: stdin.clone(),
                script,
            });
            state
                .replies
                .get_mut(&script_name)
                .and_then(VecDeque::pop_front)
        };

        let reply = reply.unwrap_or_else(|| Reply::Complete {
            meta: CLEAN_META.to_string(),
            stdout: String::from_utf8_lossy(&stdin).into_owned(),
            stderr: String::new(),
            exit_code: 0,
        });

        match reply {
            Reply::Hang => Err(EngineError::DriverTimeout {
                secs: invocation.timeout.as_secs_f64(),
            }),
            Reply::Complete {
                meta,
                stdout,
                stderr,
                exit_code,
            } => {
                if let Some(meta_file) = Self::value_after(&args, "-M") {
                    std::fs::write(meta_file, meta).unwrap();
                }
                Ok(exited(exit_code, &stdout, &stderr))
            }
        }
    }
}
