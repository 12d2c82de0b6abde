//! Study pipeline: `Init -> Build -> BenchmarkLoop(0..n) -> Commit`.
//!
//! Init and build failures abort the call before anything reaches the
//! ledger. Each benchmark iteration resolves to its own success or failure
//! and never stops the loop. The run is committed once, after the loop, or
//! early with the benchmarks executed so far when cancellation is requested.

use crate::blob::BlobStore;
use crate::config::{ensure_distinct_stems, BenchmarkConfig, HarnessLayout, RunnerConfigFile};
use crate::remote::{Connector, RemoteSession};
use crate::stages::{self, BenchmarkPaths};
use mbench_core::{
    atomic_write_bytes, now_timestamp, BenchmarkResult, Ledger, Result, Run, Stage, StudyError,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation checked between benchmark iterations.
///
/// Trips when `cancel` is called on any clone, or when the watched
/// stop-file appears. The stop-file is consumed once observed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watches `path`, discarding a stop request left over from an earlier run.
    pub fn watching(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.exists() {
            tracing::warn!(path = %path.display(), "removing stale stop request");
            let _ = fs::remove_file(&path);
        }
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            stop_file: Some(path),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.stop_file {
            if path.exists() {
                let _ = fs::remove_file(path);
                self.cancel();
                return true;
            }
        }
        false
    }
}

/// Writes the stop-file watched by a running pipeline.
pub fn request_stop(path: &Path) -> Result<()> {
    atomic_write_bytes(path, now_timestamp().to_string().as_bytes())
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub skip_init: bool,
    pub skip_build: bool,
    pub repo_url: Option<String>,
    pub repo_branch: Option<String>,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
    pub run_index: usize,
    pub succeeded: usize,
    pub total: usize,
    /// Configs that never ran because the pipeline was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

pub struct PipelineRunner<'a, C, B: ?Sized> {
    ledger: &'a Ledger,
    connector: C,
    blobs: &'a B,
    bucket: String,
}

impl<'a, C, B> PipelineRunner<'a, C, B>
where
    C: Connector,
    B: BlobStore + ?Sized,
{
    pub fn new(ledger: &'a Ledger, connector: C, blobs: &'a B, bucket: impl Into<String>) -> Self {
        Self {
            ledger,
            connector,
            blobs,
            bucket: bucket.into(),
        }
    }

    pub fn execute(
        &self,
        study_name: &str,
        runner: &RunnerConfigFile,
        configs: &[BenchmarkConfig],
        options: &ExecuteOptions,
    ) -> Result<RunOutcome> {
        let study = self.ledger.get(study_name)?;
        if configs.is_empty() {
            return Err(StudyError::InvalidInput(
                "no benchmark configuration files given".into(),
            ));
        }
        ensure_distinct_stems(configs)?;

        let layout = runner
            .config
            .layout
            .clone()
            .with_repo(options.repo_url.as_deref(), options.repo_branch.as_deref());
        let mut run = Run::new(
            runner.path.to_string_lossy(),
            runner.contents.clone(),
            now_timestamp(),
        );
        tracing::info!(study = %study_name, benchmarks = configs.len(), "starting study run");

        let mut session = self.connector.connect(&runner.config)?;

        if options.skip_init {
            tracing::info!(stage = "init", "skipped");
        } else {
            tracing::info!(stage = "init", repo = %layout.repo_url, branch = %layout.repo_branch, "initializing harness");
            stages::init_harness(&mut session, &layout)
                .map_err(|e| StudyError::fatal(Stage::Init, e))?;
        }

        if options.skip_build {
            tracing::info!(stage = "build", "skipped");
        } else {
            tracing::info!(stage = "build", core_version = %study.core_version, "building core");
            stages::build_core(&mut session, &layout, &study.core_version)
                .map_err(|e| StudyError::fatal(Stage::Build, e))?;
        }

        let staging = tempfile::Builder::new().prefix("mbench-run-").tempdir()?;
        let run_date = run.date_label();
        let mut cancelled = false;
        for (i, config) in configs.iter().enumerate() {
            if options.cancel.is_cancelled() {
                tracing::warn!(
                    study = %study_name,
                    remaining = configs.len() - i,
                    "cancellation requested, committing partial run"
                );
                cancelled = true;
                break;
            }
            tracing::info!(benchmark = %config.name, index = i, "running benchmark");
            let result = match self.run_benchmark(
                &mut session,
                &layout,
                study_name,
                &run_date,
                config,
                staging.path(),
            ) {
                Ok(paths) => {
                    tracing::info!(benchmark = %config.name, results = %paths.results, "benchmark succeeded");
                    BenchmarkResult::success(config.source.clone(), &paths.results, &paths.logs)
                }
                Err(e) => {
                    tracing::warn!(benchmark = %config.name, error = %e, "benchmark failed");
                    BenchmarkResult::failed(config.source.clone(), e.to_string())
                }
            };
            run.benchmarks.insert(config.name.clone(), result);
        }

        let succeeded = run.success_count();
        let total = run.benchmarks.len();
        let run_index = self.ledger.append_run(study_name, run.clone())?;
        Ok(RunOutcome {
            run,
            run_index,
            succeeded,
            total,
            skipped: configs.len() - total,
            cancelled,
        })
    }

    /// One loop iteration. Scratch files are removed whatever the outcome;
    /// a failed cleanup is logged and does not change the result.
    fn run_benchmark<S: RemoteSession + ?Sized>(
        &self,
        session: &mut S,
        layout: &HarnessLayout,
        study_name: &str,
        run_date: &str,
        config: &BenchmarkConfig,
        staging: &Path,
    ) -> Result<BenchmarkPaths> {
        let paths = BenchmarkPaths::new(
            layout,
            &self.bucket,
            study_name,
            run_date,
            &config.name,
            now_timestamp(),
        );
        let outcome = self.execute_and_store(session, layout, config, &paths, staging);
        let scratch = [
            paths.remote_config.as_str(),
            paths.remote_log.as_str(),
            paths.remote_zip.as_str(),
        ];
        if let Err(e) = stages::cleanup_scratch(session, layout, &scratch) {
            tracing::warn!(benchmark = %config.name, error = %e, "remote cleanup failed");
        }
        outcome.map(|_| paths)
    }

    fn execute_and_store<S: RemoteSession + ?Sized>(
        &self,
        session: &mut S,
        layout: &HarnessLayout,
        config: &BenchmarkConfig,
        paths: &BenchmarkPaths,
        staging: &Path,
    ) -> Result<()> {
        let local_config = staging.join(&config.name);
        fs::write(&local_config, &config.source)?;
        session.upload(&local_config, &paths.remote_config)?;

        let output = stages::run_harness(session, layout, &paths.remote_config, Some(paths.remote_log.as_str()))?;
        if !output.success() {
            return Err(StudyError::HarnessExit {
                status: output.exit_code,
                detail: output.tail().unwrap_or("no output").to_string(),
            });
        }

        stages::package_artifacts(session, layout, &paths.remote_zip)?;
        let local_log = staging.join(format!("{}.logs.txt", config.name));
        let local_zip = staging.join(format!("{}.results.zip", config.name));
        session.download(&paths.remote_log, &local_log)?;
        session.download(&paths.remote_zip, &local_zip)?;
        self.blobs.put(&local_log, &paths.logs)?;
        self.blobs.put(&local_zip, &paths.results)?;
        let _ = fs::remove_file(&local_log);
        let _ = fs::remove_file(&local_zip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_trips_on_stop_file_and_consumes_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stop = dir.path().join("s1.stop");
        fs::write(&stop, "old").expect("stale");

        let token = CancelToken::watching(&stop);
        assert!(!stop.exists(), "stale stop file must be cleared");
        assert!(!token.is_cancelled());

        request_stop(&stop).expect("request stop");
        let observer = token.clone();
        assert!(observer.is_cancelled());
        assert!(!stop.exists());
        assert!(token.is_cancelled(), "clones share the tripped flag");
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
