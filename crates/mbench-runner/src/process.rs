use mbench_core::{Result, StudyError};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns `cmd` with piped output and waits, killing it once `timeout` elapses.
pub fn run_with_timeout(mut cmd: Command, timeout: Option<Duration>) -> Result<ProcessOutput> {
    let program = cmd.get_program().to_string_lossy().to_string();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| StudyError::Transport(format!("failed to spawn {}: {}", program, e)))?;

    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StudyError::Transport(format!(
                    "{} timed out after {}s",
                    program,
                    limit.as_secs()
                )));
            }
        }
        thread::sleep(Duration::from_millis(20));
    };

    Ok(ProcessOutput {
        code: status.code(),
        stdout: join_reader(stdout_reader),
        stderr: join_reader(stderr_reader),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Last non-blank line across stderr then stdout, for short error messages.
pub fn output_tail<'a>(stdout: &'a str, stderr: &'a str) -> Option<&'a str> {
    [stderr, stdout].into_iter().find_map(|text| {
        text.lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("/tmp/a_b-c.json"), "/tmp/a_b-c.json");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(
            shell_join(&["echo".to_string(), "hello world".to_string()]),
            "echo 'hello world'"
        );
    }

    #[test]
    fn tail_prefers_stderr() {
        assert_eq!(output_tail("out\n", "warn\nfatal: nope\n\n"), Some("fatal: nope"));
        assert_eq!(output_tail("line1\nline2\n", "  \n"), Some("line2"));
        assert_eq!(output_tail("", ""), None);
    }

    #[cfg(unix)]
    #[test]
    fn captures_exit_code_and_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err 1>&2; exit 3");
        let out = run_with_timeout(cmd, Some(Duration::from_secs(10))).expect("run");
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let err = run_with_timeout(cmd, Some(Duration::from_millis(100))).expect_err("timeout");
        assert!(err.to_string().contains("timed out"), "{}", err);
    }
}
