//! Blob store capability addressed by (bucket, key).

use crate::process::{output_tail, run_with_timeout};
use mbench_core::{ensure_dir, BlobRef, Result, StudyError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait BlobStore {
    fn put(&self, local: &Path, blob: &BlobRef) -> Result<()>;
    fn get(&self, blob: &BlobRef, local: &Path) -> Result<()>;
}

/// Stores blobs as plain files under `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, blob: &BlobRef) -> Result<PathBuf> {
        let mut path = self.root.join(checked_segment(&blob.bucket)?);
        for part in blob.key.split('/') {
            path.push(checked_segment(part)?);
        }
        Ok(path)
    }
}

fn checked_segment(part: &str) -> Result<&str> {
    if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
        return Err(StudyError::InvalidInput(format!(
            "invalid blob path segment: {:?}",
            part
        )));
    }
    Ok(part)
}

impl BlobStore for FsBlobStore {
    fn put(&self, local: &Path, blob: &BlobRef) -> Result<()> {
        let dest = self.path_of(blob)?;
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(local, &dest)?;
        Ok(())
    }

    fn get(&self, blob: &BlobRef, local: &Path) -> Result<()> {
        let src = self.path_of(blob)?;
        if !src.is_file() {
            return Err(StudyError::NotFound(format!("blob {} not found", blob)));
        }
        if let Some(parent) = local.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(&src, local)?;
        Ok(())
    }
}

/// S3 through the `aws` CLI, so credentials and profiles follow the usual AWS config.
#[derive(Debug, Clone, Default)]
pub struct AwsCliBlobStore {
    pub profile: Option<String>,
}

impl AwsCliBlobStore {
    pub fn new(profile: Option<String>) -> Self {
        Self { profile }
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let mut cmd = Command::new("aws");
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd.arg("s3").arg("cp").arg("--only-show-errors").arg(from).arg(to);
        let out = run_with_timeout(cmd, None)?;
        if out.code == Some(0) {
            return Ok(());
        }
        Err(StudyError::Transport(format!(
            "aws s3 cp {} {} failed: {}",
            from,
            to,
            output_tail(&out.stdout, &out.stderr).unwrap_or("aws exited abnormally")
        )))
    }
}

impl BlobStore for AwsCliBlobStore {
    fn put(&self, local: &Path, blob: &BlobRef) -> Result<()> {
        self.copy(&local.to_string_lossy(), &blob.uri())
    }

    fn get(&self, blob: &BlobRef, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            ensure_dir(parent)?;
        }
        self.copy(&blob.uri(), &local.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_store_round_trips_nested_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().join("blobs"));
        let src = dir.path().join("logs.txt");
        fs::write(&src, "bench output").expect("write");

        let blob = BlobRef::new("results", "s1/2025-01-01/a_20250101_000000_000001_logs.txt");
        store.put(&src, &blob).expect("put");
        assert!(dir
            .path()
            .join("blobs/results/s1/2025-01-01/a_20250101_000000_000001_logs.txt")
            .is_file());

        let out = dir.path().join("out").join("logs.txt");
        store.get(&blob, &out).expect("get");
        assert_eq!(fs::read_to_string(out).expect("read"), "bench output");
    }

    #[test]
    fn fs_store_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let err = store
            .get(&BlobRef::new("b", "missing.zip"), &dir.path().join("x"))
            .expect_err("missing");
        assert!(matches!(err, StudyError::NotFound(_)));
    }

    #[test]
    fn fs_store_rejects_escaping_keys() {
        let store = FsBlobStore::new("/tmp/blobs");
        assert!(store.path_of(&BlobRef::new("b", "../etc/passwd")).is_err());
        assert!(store.path_of(&BlobRef::new("..", "k")).is_err());
        assert!(store.path_of(&BlobRef::new("b", "a//b")).is_err());
    }
}
