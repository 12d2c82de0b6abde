use crate::blob::BlobStore;
use mbench_core::{config_stem, ensure_dir, BlobRef, Ledger, Result, Run, StudyError};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSelector {
    All,
    Index(usize),
}

impl From<Option<usize>> for RunSelector {
    fn from(value: Option<usize>) -> Self {
        value.map(RunSelector::Index).unwrap_or(RunSelector::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFailure {
    pub artifact: &'static str,
    pub uri: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BenchmarkSync {
    pub name: String,
    pub dir: PathBuf,
    pub fetched: Vec<PathBuf>,
    pub failures: Vec<ArtifactFailure>,
}

#[derive(Debug, Clone)]
pub struct RunSync {
    pub index: usize,
    pub dir: PathBuf,
    pub benchmarks: Vec<BenchmarkSync>,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub study_dir: PathBuf,
    pub runs: Vec<RunSync>,
}

impl SyncReport {
    pub fn fetched_count(&self) -> usize {
        self.benchmarks().map(|b| b.fetched.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.benchmarks().map(|b| b.failures.len()).sum()
    }

    pub fn benchmarks(&self) -> impl Iterator<Item = &BenchmarkSync> {
        self.runs.iter().flat_map(|r| r.benchmarks.iter())
    }
}

/// Rehydrates run artifacts from the ledger into
/// `{output_dir}/{study}/run_{index}_{date}/{config_stem}/`.
pub struct Reconciler<'a, B: ?Sized> {
    ledger: &'a Ledger,
    blobs: &'a B,
}

impl<'a, B: BlobStore + ?Sized> Reconciler<'a, B> {
    pub fn new(ledger: &'a Ledger, blobs: &'a B) -> Self {
        Self { ledger, blobs }
    }

    pub fn sync(&self, study_name: &str, output_dir: &Path, selector: RunSelector) -> Result<SyncReport> {
        let study = self.ledger.get(study_name)?;
        if study.runs.is_empty() {
            return Err(StudyError::EmptyStudy(study_name.to_string()));
        }
        let selected: Vec<(usize, &Run)> = match selector {
            RunSelector::All => study.runs.iter().enumerate().collect(),
            RunSelector::Index(index) => {
                let run = study.runs.get(index).ok_or(StudyError::OutOfRange {
                    index,
                    len: study.runs.len(),
                })?;
                vec![(index, run)]
            }
        };

        let study_dir = output_dir.join(study_name);
        ensure_dir(&study_dir)?;
        tracing::info!(study = %study_name, runs = selected.len(), dir = %study_dir.display(), "syncing study");

        let mut runs = Vec::with_capacity(selected.len());
        for (index, run) in selected {
            runs.push(self.sync_run(&study_dir, index, run)?);
        }
        Ok(SyncReport { study_dir, runs })
    }

    fn sync_run(&self, study_dir: &Path, index: usize, run: &Run) -> Result<RunSync> {
        let run_dir = study_dir.join(format!("run_{}_{}", index, run.date_label()));
        ensure_dir(&run_dir)?;
        tracing::info!(run_index = index, dir = %run_dir.display(), "syncing run");

        let mut benchmarks = Vec::with_capacity(run.benchmarks.len());
        for (name, result) in run.benchmarks.iter() {
            let dir = run_dir.join(config_stem(name));
            ensure_dir(&dir)?;
            fs::write(dir.join("config.json"), &result.source)?;

            let mut bench = BenchmarkSync {
                name: name.to_string(),
                dir: dir.clone(),
                ..Default::default()
            };
            for (artifact, uri, file) in [
                ("results", &result.results_uri, "results.zip"),
                ("logs", &result.logs_uri, "logs.txt"),
            ] {
                if uri.is_empty() {
                    continue;
                }
                let target = dir.join(file);
                match self.fetch(uri, &target) {
                    Ok(()) => {
                        tracing::info!(benchmark = %name, artifact, "downloaded");
                        bench.fetched.push(target);
                    }
                    Err(e) => {
                        tracing::warn!(benchmark = %name, artifact, %uri, error = %e, "download failed");
                        bench.failures.push(ArtifactFailure {
                            artifact,
                            uri: uri.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            benchmarks.push(bench);
        }
        Ok(RunSync {
            index,
            dir: run_dir,
            benchmarks,
        })
    }

    fn fetch(&self, uri: &str, target: &Path) -> Result<()> {
        let blob = BlobRef::parse(uri)
            .ok_or_else(|| StudyError::InvalidInput(format!("unparseable blob uri: {}", uri)))?;
        self.blobs.get(&blob, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_from_optional_index() {
        assert_eq!(RunSelector::from(None), RunSelector::All);
        assert_eq!(RunSelector::from(Some(3)), RunSelector::Index(3));
    }
}
