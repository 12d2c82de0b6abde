use crate::error::{Result, StudyError};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes `bytes` to a sibling temp file, fsyncs it and renames it over `path`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

/// Exclusive lock held as long as the lock file exists. Dropping it removes the file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn try_acquire_lock(lock_path: &Path) -> Result<Option<FileLock>> {
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(Some(FileLock {
                path: lock_path.to_path_buf(),
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Polls for the lock until `timeout` elapses. A lock left behind by a
/// process that no longer exists is removed and taken over.
pub fn acquire_lock(lock_path: &Path, timeout: Duration) -> Result<FileLock> {
    let start = Instant::now();
    let mut logged = false;
    loop {
        if let Some(lock) = try_acquire_lock(lock_path)? {
            return Ok(lock);
        }
        if break_stale_lock(lock_path)? {
            continue;
        }
        if start.elapsed() >= timeout {
            return Err(StudyError::Locked(lock_path.to_path_buf()));
        }
        if !logged {
            tracing::debug!(lock = %lock_path.display(), "waiting for ledger lock");
            logged = true;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn lock_holder(lock_path: &Path) -> Option<u32> {
    let raw = fs::read(lock_path).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value.get("pid")?.as_u64().and_then(|p| u32::try_from(p).ok())
}

/// Removes the lock file when its recorded holder is gone. Unreadable
/// payloads are left alone.
fn break_stale_lock(lock_path: &Path) -> Result<bool> {
    let Some(pid) = lock_holder(lock_path) else {
        return Ok(false);
    };
    if pid == std::process::id() || process_alive(pid) {
        return Ok(false);
    }
    // Another waiter may have replaced it since the first read.
    if lock_holder(lock_path) != Some(pid) {
        return Ok(false);
    }
    tracing::warn!(lock = %lock_path.display(), pid, "removing lock left by a dead process");
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM means it exists under another user.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("s1.lock");

        let first = acquire_lock(&lock_path, Duration::from_millis(10)).expect("first lock");
        let err = acquire_lock(&lock_path, Duration::from_millis(60)).expect_err("second lock");
        assert!(matches!(err, StudyError::Locked(_)), "unexpected: {}", err);
        drop(first);
        let again = acquire_lock(&lock_path, Duration::from_millis(10)).expect("re-acquire");
        assert!(again.path().exists());
    }

    #[test]
    fn atomic_write_replaces_contents_without_leftovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doc.json");
        atomic_write_bytes(&path, b"first").expect("write 1");
        atomic_write_bytes(&path, b"second").expect("write 2");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn lock_left_by_dead_process_is_taken_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join(".s1.lock");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");
        fs::write(&lock_path, format!("{{\"pid\":{}}}", dead_pid)).expect("stale lock");

        let start = Instant::now();
        let lock = acquire_lock(&lock_path, Duration::from_secs(5)).expect("take over");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(lock_holder(lock.path()), Some(std::process::id()));
    }

    #[test]
    fn lock_held_by_live_process_is_respected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join(".s1.lock");
        fs::write(&lock_path, format!("{{\"pid\":{}}}", std::process::id())).expect("lock");
        let err = acquire_lock(&lock_path, Duration::from_millis(60)).expect_err("held");
        assert!(matches!(err, StudyError::Locked(_)), "{}", err);
        assert!(lock_path.exists());
    }
}
