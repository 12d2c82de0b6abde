#![allow(dead_code)]

use mbench_core::{Ledger, Result, Study, StudyError};
use mbench_runner::{
    BenchmarkConfig, CancelToken, CommandOutput, Connector, FsBlobStore, RemoteSession,
    RunnerConfig, RunnerConfigFile,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

/// What the fake worker has seen, shared between the connector and the test.
#[derive(Default)]
pub struct WorkerState {
    pub connects: usize,
    pub commands: Vec<String>,
    pub files: HashMap<String, Vec<u8>>,
    /// Commands containing the pattern exit with the code.
    pub exit_on: Vec<(String, i32)>,
    /// Commands, uploads or downloads touching the pattern fail at the transport level.
    pub break_on: Vec<String>,
    /// Trips the token once a command containing the pattern has run.
    pub cancel_on: Option<(String, CancelToken)>,
}

impl WorkerState {
    pub fn commands_matching(&self, needle: &str) -> Vec<&String> {
        self.commands.iter().filter(|c| c.contains(needle)).collect()
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub state: Rc<RefCell<WorkerState>>,
}

impl FakeConnector {
    pub fn exit_on(&self, pattern: &str, code: i32) {
        self.state.borrow_mut().exit_on.push((pattern.to_string(), code));
    }

    pub fn break_on(&self, pattern: &str) {
        self.state.borrow_mut().break_on.push(pattern.to_string());
    }

    pub fn cancel_on(&self, pattern: &str, token: CancelToken) {
        self.state.borrow_mut().cancel_on = Some((pattern.to_string(), token));
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    fn connect(&self, _runner: &RunnerConfig) -> Result<FakeSession> {
        self.state.borrow_mut().connects += 1;
        Ok(FakeSession {
            state: Rc::clone(&self.state),
        })
    }
}

pub struct FakeSession {
    state: Rc<RefCell<WorkerState>>,
}

impl FakeSession {
    fn check_transport(&self, subject: &str) -> Result<()> {
        let state = self.state.borrow();
        if let Some(p) = state.break_on.iter().find(|p| subject.contains(p.as_str())) {
            return Err(StudyError::Transport(format!("connection reset while handling {}", p)));
        }
        Ok(())
    }
}

impl RemoteSession for FakeSession {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        self.check_transport(command)?;
        let mut state = self.state.borrow_mut();
        state.commands.push(command.to_string());
        if let Some((pattern, token)) = &state.cancel_on {
            if command.contains(pattern.as_str()) {
                token.cancel();
            }
        }
        let exit_code = state
            .exit_on
            .iter()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(CommandOutput {
            exit_code,
            stdout: format!("ran: {}\n", command),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "Unhandled exception: benchmark crashed\n".to_string()
            },
        })
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        self.check_transport(remote)?;
        let bytes = fs::read(local)?;
        self.state.borrow_mut().files.insert(remote.to_string(), bytes);
        Ok(())
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.check_transport(remote)?;
        let bytes = self
            .state
            .borrow()
            .files
            .get(remote)
            .cloned()
            .unwrap_or_else(|| format!("contents of {}", remote).into_bytes());
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(local, bytes)?;
        Ok(())
    }
}

pub struct Workspace {
    pub dir: TempDir,
    pub ledger: Ledger,
    pub blobs: FsBlobStore,
    pub runner: RunnerConfigFile,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path().join("studies"));
        let blobs = FsBlobStore::new(dir.path().join("blobs"));
        let runner_path = dir.path().join("runner.json");
        fs::write(
            &runner_path,
            r#"{"host": "bench.example", "key": "./benchmark_key.pem", "region": "eu-west-3"}"#,
        )
        .expect("runner config");
        let runner = RunnerConfigFile::load(&runner_path).expect("load runner config");
        Self {
            dir,
            ledger,
            blobs,
            runner,
        }
    }

    pub fn create_study(&self, name: &str, core_version: &str) -> Study {
        let study = Study::new(name, core_version, "latest", "./benchmark_key.pem");
        self.ledger.create(&study).expect("create study");
        study
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("results")
    }
}

pub fn configs(names: &[&str]) -> Vec<BenchmarkConfig> {
    names
        .iter()
        .map(|n| BenchmarkConfig::new(*n, format!("{{\"benchmark\": \"{}\"}}", n)))
        .collect()
}
