//! Remote execution capability and its `ssh`/`scp` implementation.

use crate::config::RunnerConfig;
use crate::process::{output_tail, run_with_timeout, ProcessOutput};
use mbench_core::{Result, StudyError};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn tail(&self) -> Option<&str> {
        output_tail(&self.stdout, &self.stderr)
    }
}

/// One logical connection to the worker host.
///
/// `run` returns `Err` only when the command could not be carried out;
/// a command that ran and exited non-zero is an `Ok` with that exit code.
pub trait RemoteSession {
    fn run(&mut self, command: &str) -> Result<CommandOutput>;
    fn upload(&mut self, local: &Path, remote: &str) -> Result<()>;
    fn download(&mut self, remote: &str, local: &Path) -> Result<()>;
}

impl<S: RemoteSession + ?Sized> RemoteSession for &mut S {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        (**self).run(command)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        (**self).upload(local, remote)
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
        (**self).download(remote, local)
    }
}

/// Opens sessions from runner connection parameters.
pub trait Connector {
    type Session: RemoteSession;

    fn connect(&self, runner: &RunnerConfig) -> Result<Self::Session>;
}

/// Runs `command` and turns a non-zero exit into a transport error.
pub fn run_checked<S: RemoteSession + ?Sized>(session: &mut S, command: &str) -> Result<CommandOutput> {
    let output = session.run(command)?;
    if !output.success() {
        return Err(StudyError::Transport(format!(
            "remote command exited with status {}: {}",
            output.exit_code,
            output.tail().unwrap_or("no output")
        )));
    }
    Ok(output)
}

const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    /// Overrides the runner config's `command_timeout_secs` when set.
    pub command_timeout: Option<Duration>,
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(&self, runner: &RunnerConfig) -> Result<SshSession> {
        let mut session = SshSession {
            target: format!("{}@{}", runner.user, runner.host),
            key: runner.key.clone(),
            timeout: self.command_timeout.or(runner.command_timeout),
        };
        tracing::info!(host = %session.target, "opening ssh session");
        run_checked(&mut session, "true")?;
        Ok(session)
    }
}

#[derive(Debug, Clone)]
pub struct SshSession {
    target: String,
    key: PathBuf,
    timeout: Option<Duration>,
}

impl SshSession {
    fn base_args(&self, cmd: &mut Command) {
        cmd.arg("-i")
            .arg(&self.key)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
    }

    fn copy(&self, from: String, to: String) -> Result<()> {
        let mut cmd = Command::new("scp");
        self.base_args(&mut cmd);
        cmd.arg("-q").arg(&from).arg(&to);
        let out = run_with_timeout(cmd, self.timeout)?;
        check_copy(&out, &from, &to)
    }
}

fn check_copy(out: &ProcessOutput, from: &str, to: &str) -> Result<()> {
    if out.code == Some(0) {
        return Ok(());
    }
    Err(StudyError::Transport(format!(
        "copy {} -> {} failed: {}",
        from,
        to,
        output_tail(&out.stdout, &out.stderr).unwrap_or("scp exited abnormally")
    )))
}

impl RemoteSession for SshSession {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(host = %self.target, %command, "remote run");
        let mut cmd = Command::new("ssh");
        self.base_args(&mut cmd);
        cmd.arg(&self.target).arg(command);
        let out = run_with_timeout(cmd, self.timeout)?;
        match out.code {
            Some(SSH_CONNECTION_FAILURE) => Err(StudyError::Transport(format!(
                "ssh to {} failed: {}",
                self.target,
                output_tail("", &out.stderr).unwrap_or("connection error")
            ))),
            Some(code) => Ok(CommandOutput {
                exit_code: code,
                stdout: out.stdout,
                stderr: out.stderr,
            }),
            None => Err(StudyError::Transport(format!(
                "ssh to {} terminated by signal",
                self.target
            ))),
        }
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        tracing::debug!(host = %self.target, local = %local.display(), %remote, "upload");
        self.copy(
            local.to_string_lossy().to_string(),
            format!("{}:{}", self.target, remote),
        )
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
        tracing::debug!(host = %self.target, %remote, local = %local.display(), "download");
        if let Some(parent) = local.parent() {
            mbench_core::ensure_dir(parent)?;
        }
        self.copy(
            format!("{}:{}", self.target, remote),
            local.to_string_lossy().to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(i32);

    impl RemoteSession for Scripted {
        fn run(&mut self, _command: &str) -> Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: self.0,
                stdout: "building...\n".to_string(),
                stderr: "error CS0246: type not found\n".to_string(),
            })
        }

        fn upload(&mut self, _local: &Path, _remote: &str) -> Result<()> {
            Ok(())
        }

        fn download(&mut self, _remote: &str, _local: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn run_checked_reports_exit_status_and_tail() {
        let err = run_checked(&mut Scripted(1), "dotnet build").expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("status 1"), "{}", msg);
        assert!(msg.contains("CS0246"), "{}", msg);
        assert!(run_checked(&mut Scripted(0), "true").is_ok());
    }

    #[test]
    fn copy_failure_is_transport_error() {
        let out = ProcessOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "scp: /tmp/x: No such file or directory\n".to_string(),
        };
        let err = check_copy(&out, "h:/tmp/x", "/local/x").expect_err("fail");
        assert!(matches!(err, StudyError::Transport(_)));
        assert!(err.to_string().contains("No such file"));
    }
}
