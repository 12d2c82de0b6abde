use crate::error::{Result, StudyError};
use crate::io::{acquire_lock, atomic_write_json_pretty, ensure_dir, FileLock};
use crate::model::{Run, Study};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory of study documents, one `{name}.json` per study.
///
/// `get`/`put` are the raw record operations; `create` and `append_run`
/// layer the create-vs-update rules on top and hold the per-study lock
/// across their read-modify-write.
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn study_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{}.lock", name))
    }

    /// Path of the stop-file that asks a running `study run` to wind down.
    pub fn stop_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.stop", name))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        validate_study_name(name)?;
        Ok(self.study_path(name).is_file())
    }

    pub fn get(&self, name: &str) -> Result<Study> {
        validate_study_name(name)?;
        let path = self.study_path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StudyError::NotFound(format!(
                    "study '{}' not found at {}",
                    name,
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Create-or-overwrite. Last writer wins across processes that bypass the lock.
    pub fn put(&self, name: &str, study: &Study) -> Result<()> {
        validate_study_name(name)?;
        if study.name != name {
            return Err(StudyError::InvalidInput(format!(
                "study record is named '{}' but would be stored as '{}'",
                study.name, name
            )));
        }
        let _lock = self.lock(name)?;
        self.write_unlocked(name, study)
    }

    pub fn create(&self, study: &Study) -> Result<()> {
        validate_study_name(&study.name)?;
        let _lock = self.lock(&study.name)?;
        let path = self.study_path(&study.name);
        if path.exists() {
            return Err(StudyError::AlreadyExists(format!(
                "study '{}' already exists at {}",
                study.name,
                path.display()
            )));
        }
        self.write_unlocked(&study.name, study)?;
        tracing::info!(study = %study.name, path = %path.display(), "created study");
        Ok(())
    }

    /// Appends `run` under the study lock and returns its index.
    pub fn append_run(&self, name: &str, run: Run) -> Result<usize> {
        validate_study_name(name)?;
        let _lock = self.lock(name)?;
        let mut study = self.get(name)?;
        study.runs.push(run);
        let index = study.runs.len() - 1;
        self.write_unlocked(name, &study)?;
        tracing::info!(study = %name, run_index = index, "committed run");
        Ok(index)
    }

    /// Study names in lexical order.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn lock(&self, name: &str) -> Result<FileLock> {
        ensure_dir(&self.dir)?;
        acquire_lock(&self.lock_path(name), LOCK_TIMEOUT)
    }

    fn write_unlocked(&self, name: &str, study: &Study) -> Result<()> {
        atomic_write_json_pretty(&self.study_path(name), study)
    }
}

pub fn validate_study_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StudyError::InvalidInput("study name cannot be empty".into()));
    }
    if name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(StudyError::InvalidInput(format!(
            "invalid study name '{}': must not start with '.' or contain path separators",
            name
        )));
    }
    Ok(())
}
